//! Frame callback registry
//!
//! Handles are indices into the registry and stay valid for its lifetime:
//! unregistering swaps the entry for a no-op instead of removing it.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// `(pixels, width, height)`; the byte length is `pixels.len()`
pub type FrameCallback = Arc<dyn Fn(&[u8], u32, u32) + Send + Sync>;

/// Opaque registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(pub u64);

struct Entry {
    callback: FrameCallback,
    active: bool,
}

#[derive(Default)]
pub struct CallbackRegistry {
    entries: RwLock<Vec<Entry>>,
    failures: AtomicU64,
}

fn noop() -> FrameCallback {
    Arc::new(|_: &[u8], _: u32, _: u32| {})
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: FrameCallback) -> CallbackHandle {
        let mut entries = self.entries.write();
        entries.push(Entry {
            callback,
            active: true,
        });
        let handle = CallbackHandle(entries.len() as u64 - 1);
        debug!(target: "framelink_core::callbacks", handle = handle.0, "Frame callback registered");
        handle
    }

    /// Returns `false` for an unknown or already removed handle
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(handle.0 as usize) {
            Some(entry) if entry.active => {
                entry.callback = noop();
                entry.active = false;
                debug!(target: "framelink_core::callbacks", handle = handle.0, "Frame callback removed");
                true
            }
            _ => false,
        }
    }

    /// Registered callbacks still active
    pub fn len(&self) -> usize {
        self.entries.read().iter().filter(|e| e.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback panics swallowed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Call every active callback. The lock is released before any of them
    /// runs, so a callback may register or unregister others.
    pub fn dispatch(&self, pixels: &[u8], width: u32, height: u32) {
        let snapshot: Vec<(usize, FrameCallback)> = self
            .entries
            .read()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active)
            .map(|(i, e)| (i, e.callback.clone()))
            .collect();

        for (handle, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(pixels, width, height))).is_err() {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "framelink_core::callbacks",
                    handle,
                    "Frame callback panicked, skipped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_handles_stay_stable() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3u32)
            .map(|i| {
                let seen = seen.clone();
                registry.register(Arc::new(move |_: &[u8], _, _| seen.lock().push(i)))
            })
            .collect();
        assert_eq!(handles[2], CallbackHandle(2));

        assert!(registry.unregister(handles[1]));
        assert!(!registry.unregister(handles[1]));
        assert!(!registry.unregister(CallbackHandle(42)));

        // New registrations never reuse a slot
        let seen4 = seen.clone();
        let h = registry.register(Arc::new(move |_: &[u8], _, _| seen4.lock().push(3)));
        assert_eq!(h, CallbackHandle(3));

        registry.dispatch(&[1, 2, 3, 4], 1, 1);
        assert_eq!(*seen.lock(), vec![0, 2, 3]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_dispatch_passes_frame() {
        let registry = CallbackRegistry::new();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        registry.register(Arc::new(move |pixels: &[u8], w, h| {
            *got2.lock() = Some((pixels.len(), w, h));
        }));
        registry.dispatch(&[0; 32], 4, 2);
        assert_eq!(*got.lock(), Some((32, 4, 2)));
    }

    #[test]
    fn test_panicking_callback_isolated() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicU64::new(0));
        registry.register(Arc::new(|_: &[u8], _, _| panic!("bad consumer")));
        let counter = calls.clone();
        registry.register(Arc::new(move |_: &[u8], _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(&[0; 4], 1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.failures(), 1);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let registry = Arc::new(CallbackRegistry::new());
        let weak = Arc::downgrade(&registry);
        registry.register(Arc::new(move |_: &[u8], _, _| {
            if let Some(registry) = weak.upgrade() {
                registry.unregister(CallbackHandle(0));
            }
        }));
        registry.dispatch(&[], 0, 0);
        assert!(registry.is_empty());
    }
}
