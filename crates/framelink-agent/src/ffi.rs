//! C ABI for hosts and plugins loaded next to the agent

use framelink_core::{CallbackHandle, CallbackRegistry};
use once_cell::sync::Lazy;
use std::ffi::c_void;
use std::sync::Arc;

/// `(pixels, byte_length, width, height, user)`
pub type RawFrameCallback =
    extern "C" fn(pixels: *const u8, len: usize, width: u32, height: u32, user: *mut c_void);

/// Returned by registration when no callback was given
pub const INVALID_CALLBACK_HANDLE: u64 = u64::MAX;

/// Frame callbacks of this process, shared with the pipeline
pub(crate) static CALLBACKS: Lazy<Arc<CallbackRegistry>> =
    Lazy::new(|| Arc::new(CallbackRegistry::new()));

struct UserData(*mut c_void);

// Opaque to us; the registrant vouches for cross-thread use
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    // Called inside closures so they capture the whole wrapper
    fn get(&self) -> *mut c_void {
        self.0
    }
}

/// Register a frame callback. It runs on the host's render thread for
/// every captured frame until unregistered.
#[no_mangle]
pub extern "C" fn framelink_register_frame_callback(
    callback: Option<RawFrameCallback>,
    user: *mut c_void,
) -> u64 {
    let Some(callback) = callback else {
        return INVALID_CALLBACK_HANDLE;
    };
    let user = UserData(user);
    let handle = CALLBACKS.register(Arc::new(move |pixels: &[u8], width, height| {
        callback(pixels.as_ptr(), pixels.len(), width, height, user.get());
    }));
    handle.0
}

/// Stop calling a registered callback. Handles are never reused.
#[no_mangle]
pub extern "C" fn framelink_unregister_frame_callback(handle: u64) -> bool {
    CALLBACKS.unregister(CallbackHandle(handle))
}

/// Whether the present hook is currently installed
#[no_mangle]
pub extern "C" fn framelink_is_capturing() -> bool {
    crate::with_pipeline(|pipeline| pipeline.is_capturing()).unwrap_or(false)
}

/// Remove all hooks and release the frame ring ahead of unloading
#[no_mangle]
pub extern "C" fn framelink_shutdown() -> bool {
    crate::shutdown_pipeline()
}
