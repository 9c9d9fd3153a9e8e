//! # Engine Configuration
//!
//! All recognized options for the frame core, grouped by subsystem:
//!
//! - **Renderer**: validation, frames in flight, present mode, minimize and
//!   driver-compatibility behavior
//! - **Logging**: minimum severity and the optional append-only log file
//! - **Window**: initial size and title of the presentation window
//!
//! Every section is `#[serde(default)]`, so partial files are accepted.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::config::{Config, ConfigError};
use crate::foundation::logging::LogSeverity;

/// Presentation mode requested by the application
///
/// Falls back to [`PresentModePreference::Fifo`] when the surface does not
/// offer the requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentModePreference {
    /// No vsync, tearing possible
    Immediate,
    /// Triple-buffered vsync without blocking
    Mailbox,
    /// Strict vsync; always supported
    Fifo,
    /// Vsync that tears when a frame is late
    FifoRelaxed,
}

impl PresentModePreference {
    /// The matching Vulkan present mode
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

impl Default for PresentModePreference {
    fn default() -> Self {
        Self::Mailbox
    }
}

/// # Renderer Configuration
///
/// Options consumed by the device context, presentation surface and frame
/// driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Enable validation layers and the debug messenger
    pub enable_validation: bool,
    /// Number of frame slots (F)
    pub max_frames_in_flight: usize,
    /// Requested presentation mode
    pub preferred_present_mode: PresentModePreference,
    /// Block in recreation while the window has zero area
    pub pause_on_minimize: bool,
    /// Enable portability enumeration for layered drivers
    pub driver_compat_shims: bool,
    /// Swap image acquire timeout in nanoseconds; a frame that times out
    /// is skipped
    // TOML integers are signed, so the unbounded default is left out on save
    #[serde(skip_serializing_if = "is_unbounded")]
    pub acquire_timeout_ns: u64,
    /// Clear color of the forward pass
    pub clear_color: [f32; 4],
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            enable_validation: cfg!(debug_assertions),
            max_frames_in_flight: 2,
            preferred_present_mode: PresentModePreference::default(),
            pause_on_minimize: true,
            driver_compat_shims: cfg!(target_os = "macos"),
            acquire_timeout_ns: u64::MAX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Set the requested present mode
    pub fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.preferred_present_mode = mode;
        self
    }

    /// Block or skip frames while minimized
    pub fn with_pause_on_minimize(mut self, pause: bool) -> Self {
        self.pause_on_minimize = pause;
        self
    }

    /// Enable portability shims
    pub fn with_driver_compat_shims(mut self, enabled: bool) -> Self {
        self.driver_compat_shims = enabled;
        self
    }

    /// Set the clear color
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.max_frames_in_flight == 0 {
            return Err("Max frames in flight must be at least 1".to_string());
        }

        if self.acquire_timeout_ns == 0 {
            return Err("Acquire timeout must be non-zero".to_string());
        }

        Ok(())
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_unbounded(timeout_ns: &u64) -> bool {
    *timeout_ns == u64::MAX
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Frame Engine Application")
    }
}

/// # Logging Configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Messages below this severity are dropped
    pub min_severity: LogSeverity,
    /// Append log output to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Set minimum severity
    pub fn with_min_severity(mut self, severity: LogSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Set the log file
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// # Window Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
    /// Whether the user may resize the window
    pub resizable: bool,
}

impl WindowConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "Window size must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        Ok(())
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Engine".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// # Complete Application Configuration
///
/// Top-level configuration applications load from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Rendering system configuration
    pub renderer: RendererConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Window configuration
    pub window: WindowConfig,
}

impl ApplicationConfig {
    /// Create a new application configuration with defaults
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        Self {
            renderer: RendererConfig::new(app_name.clone()),
            logging: LoggingConfig::default(),
            window: WindowConfig {
                title: app_name,
                ..WindowConfig::default()
            },
        }
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), String> {
        self.renderer.validate()?;
        self.window.validate()?;
        Ok(())
    }
}

impl Config for ApplicationConfig {
    fn check(&self) -> Result<(), String> {
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.preferred_present_mode, PresentModePreference::Mailbox);
        assert!(config.pause_on_minimize);
        assert_eq!(config.acquire_timeout_ns, u64::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let config = RendererConfig::default().with_max_frames_in_flight(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = ApplicationConfig::new("test");
        config.window.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [renderer]
            max_frames_in_flight = 3
            preferred_present_mode = "Fifo"

            [logging]
            min_severity = "Warning"
        "#;
        let config: ApplicationConfig = toml::from_str(text).unwrap();
        assert_eq!(config.renderer.max_frames_in_flight, 3);
        assert_eq!(config.renderer.preferred_present_mode, PresentModePreference::Fifo);
        assert_eq!(config.logging.min_severity, LogSeverity::Warning);
        assert!(config.logging.log_file.is_none());
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn test_default_serializes_to_toml() {
        let config = ApplicationConfig::new("toml");
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("acquire_timeout_ns"));
        let parsed: ApplicationConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.renderer.acquire_timeout_ns, u64::MAX);
        assert_eq!(parsed.renderer.application_name, "toml");
    }

    #[test]
    fn test_invalid_file_rejected_on_load() {
        let path = std::env::temp_dir().join(format!("frame_engine_invalid_{}.toml", std::process::id()));
        std::fs::write(&path, "[renderer]\nmax_frames_in_flight = 0\n").unwrap();

        let result = ApplicationConfig::load_validated(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        // A missing file falls back to defaults, which pass
        assert!(ApplicationConfig::load_validated(path.with_extension("missing.toml")).is_ok());
    }

    #[test]
    fn test_ron_roundtrip() {
        let config = ApplicationConfig::new("roundtrip");
        let text = ron::ser::to_string(&config).unwrap();
        let parsed: ApplicationConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed.renderer.application_name, "roundtrip");
        assert_eq!(parsed.window.title, "roundtrip");
    }

    #[test]
    fn test_present_mode_mapping() {
        assert_eq!(PresentModePreference::Fifo.to_vk(), vk::PresentModeKHR::FIFO);
        assert_eq!(PresentModePreference::Mailbox.to_vk(), vk::PresentModeKHR::MAILBOX);
    }
}
