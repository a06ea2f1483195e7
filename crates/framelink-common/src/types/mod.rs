//! Common types used across framelink components
//!
//! - `memory` - memory protection and region types
//! - `pattern` - byte signature types
//! - `hooks` - function-table hook records
//! - `frame` - captured frames, pixel formats, transport encodings

pub mod frame;
pub mod hooks;
pub mod memory;
pub mod pattern;

pub use frame::*;
pub use hooks::*;
pub use memory::*;
pub use pattern::*;
