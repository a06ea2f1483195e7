//! framelink common types
//!
//! Errors, logging, configuration and the plain data types shared by the
//! capture core, the injected agent and the external reader.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{CaptureConfig, PipelineConfig, TransportConfig};
pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_host_logging, init_logging, LogConfig, LOG_ENV};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
