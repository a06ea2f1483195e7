//! framelink
//!
//! Direct3D 11 frame interception and shared-memory export. The work is
//! split across the workspace crates; this facade re-exports them for
//! embedders and the workspace integration tests.

pub use framelink_common as common;
pub use framelink_core as core;

pub use framelink_common::{Error, FrameData, PipelineConfig, Result};
pub use framelink_core::{SharedMemoryRingTransport, TransportOptions};
