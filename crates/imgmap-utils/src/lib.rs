//! # imgmap Utilities
//!
//! Logging setup shared by hosts of the imgmap crates.
//!
//! `imgmap-core` only emits `tracing` events and never installs a
//! subscriber; this crate is where an application picks the output format
//! and destination.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    default_log_path, init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingError,
};
pub use tracing::{debug, error, info, trace, warn};
