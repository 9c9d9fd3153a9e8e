//! Render error taxonomy

use ash::vk;
use thiserror::Error;

use crate::render::window::WindowError;

/// Errors raised by the frame core
#[derive(Error, Debug)]
pub enum RenderError {
    /// Creating or allocating a device object failed
    #[error("Failed to {operation}: {result:?}")]
    GraphicsResource {
        /// What was being created or executed
        operation: &'static str,
        /// Result code reported by the driver
        result: vk::Result,
    },

    /// No memory type satisfies the requested properties
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Device context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// API misuse
    #[error("Illegal state: {reason}")]
    IllegalState {
        /// What was wrong with the call
        reason: String,
    },

    /// Lookup of an undeclared binding index
    #[error("Binding {binding} is not declared")]
    NotFound {
        /// Binding index that was requested
        binding: u32,
    },

    /// A one-shot upload or layout transition failed
    #[error("Transient operation '{operation}' failed: {result:?}")]
    TransientOp {
        /// Operation being executed
        operation: &'static str,
        /// Result code reported by the driver
        result: vk::Result,
    },

    /// The surface no longer matches the swap image set
    #[error("Presentation surface is stale")]
    SurfaceStale,

    /// Window system failure
    #[error("Window error: {0}")]
    Window(#[from] WindowError),
}

impl RenderError {
    /// Build an `IllegalState` error
    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    /// Whether the error must terminate the frame loop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SurfaceStale)
    }
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Adapter for `map_err` on raw device calls
pub(crate) fn resource(operation: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| RenderError::GraphicsResource { operation, result }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stale_is_recoverable() {
        assert!(!RenderError::SurfaceStale.is_fatal());
        assert!(RenderError::illegal("build twice").is_fatal());
        assert!(RenderError::NotFound { binding: 3 }.is_fatal());
        assert!(resource("create fence")(vk::Result::ERROR_DEVICE_LOST).is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = resource("create buffer")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(
            err.to_string(),
            "Failed to create buffer: ERROR_OUT_OF_DEVICE_MEMORY"
        );
        assert_eq!(
            RenderError::NotFound { binding: 7 }.to_string(),
            "Binding 7 is not declared"
        );
    }
}
