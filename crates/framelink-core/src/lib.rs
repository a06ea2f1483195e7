//! framelink core
//!
//! Everything that runs inside the host process: signature scanning, function
//! table and export hooks, the present and factory interceptors, back-buffer
//! capture, and the shared-memory ring that carries frames out.

pub mod callbacks;
pub mod export_hooks;
pub mod factory_hooks;
pub mod frame_extractor;
pub mod hook_set;
pub mod memory;
pub mod patch;
pub mod pattern_scanner;
pub mod pe;
pub mod present_hook;
pub mod signatures;
pub mod transport;
pub mod vtable;

pub use callbacks::{CallbackHandle, CallbackRegistry, FrameCallback};
pub use export_hooks::ExportHookManager;
pub use factory_hooks::{FactoryInterceptor, SharedPresentationHook};
pub use frame_extractor::{ExtractorStats, FrameExtractor};
pub use framelink_common::{Error, Result};
pub use hook_set::HookSet;
pub use pattern_scanner::{ScanSession, SignatureScanner};
pub use present_hook::{PresentCallback, PresentationHook};
pub use transport::compression::{CodecSet, FrameCodec};
pub use transport::{SharedMemoryRingTransport, TransportOptions};
pub use vtable::VTableHookEngine;
