//! Core engine types shared by every subsystem

pub mod config;

pub use config::{ApplicationConfig, LoggingConfig, PresentModePreference, RendererConfig, WindowConfig};
