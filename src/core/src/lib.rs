//! Kiln Core - Shared Types
//!
//! Error taxonomy and build options used by the kiln image builder.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BuildOptions, MountSpec};
pub use error::{BuildError, ErrorKind, Result};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
