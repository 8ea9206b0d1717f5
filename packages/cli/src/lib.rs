// ABOUTME: Library half of the sbpanel binary
// ABOUTME: Configuration loading and wiring of storage, runtime and managers

pub mod config;
pub mod panel;

pub use config::{Config, ConfigError};
pub use panel::Panel;
