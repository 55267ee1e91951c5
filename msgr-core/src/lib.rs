//! Msgr Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by the other msgr crates:
//! - Listener, transport and HTTP configuration persisted as TOML
//! - A single error enum covering every failure category
//! - Structured logging with tracing
//! - Platform directories and protocol constants

pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod constants;

// Re-export commonly used items at the crate root
pub use config::{AppConfig, ListenConfig, TransportConfig};
pub use error::{MsgrError, MsgrResult};
pub use logging::init_logging;
pub use platform::Platform;
