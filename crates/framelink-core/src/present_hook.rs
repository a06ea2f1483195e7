//! Presentation interception
//!
//! The present slot of a swap chain's function table is replaced by
//! [`present_thunk`]. A bare function pointer carries no instance context,
//! so the thunk finds its target through one process-wide dispatch record:
//! set by [`PresentationHook::install`], cleared by
//! [`PresentationHook::remove`] or drop. Only one presentation hook can be
//! active per process; a second instance trying to install is refused.

use crate::signatures::SWAP_CHAIN_PRESENT_INDEX;
use crate::vtable::VTableHookEngine;
use framelink_common::{Error, HookState, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// `IDXGISwapChain::Present(this, SyncInterval, Flags) -> HRESULT`
pub type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> i32;

/// Invoked with the live swap chain before each forwarded present
pub type PresentCallback = Arc<dyn Fn(*mut c_void) + Send + Sync>;

pub(crate) const E_FAIL: i32 = 0x8000_4005_u32 as i32;

struct ActiveDispatch {
    owner: u32,
    original: PresentFn,
    callback: Option<PresentCallback>,
}

/// Current dispatch target for [`present_thunk`]
static ACTIVE_PRESENT: Lazy<RwLock<Option<ActiveDispatch>>> = Lazy::new(|| RwLock::new(None));

/// Last original seen, kept after removal for calls already past the slot
static LAST_ORIGINAL: AtomicUsize = AtomicUsize::new(0);

static CALLBACK_FAILURES: AtomicU64 = AtomicU64::new(0);

static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_instance_id() -> u32 {
    INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Number of callback panics swallowed at the dispatch boundary
pub fn callback_failures() -> u64 {
    CALLBACK_FAILURES.load(Ordering::Relaxed)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

/// Replacement for the present slot. Runs on the host's render thread.
///
/// # Safety
/// Only ever called by the host through the patched table, with the
/// arguments of the original method.
pub unsafe extern "system" fn present_thunk(
    swap_chain: *mut c_void,
    sync_interval: u32,
    flags: u32,
) -> i32 {
    let (original, callback) = {
        let active = ACTIVE_PRESENT.read();
        match active.as_ref() {
            Some(dispatch) => (Some(dispatch.original), dispatch.callback.clone()),
            None => (None, None),
        }
    };

    if let Some(callback) = callback {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(swap_chain))) {
            CALLBACK_FAILURES.fetch_add(1, Ordering::Relaxed);
            error!(
                target: "framelink_core::present_hook",
                message = %panic_message(payload.as_ref()),
                "Present callback failed, forwarding anyway"
            );
        }
    }

    let original = original.or_else(|| {
        let raw = LAST_ORIGINAL.load(Ordering::SeqCst);
        (raw != 0).then(|| std::mem::transmute::<usize, PresentFn>(raw))
    });

    match original {
        Some(present) => present(swap_chain, sync_interval, flags),
        None => E_FAIL,
    }
}

/// Hook on the present method of one swap-chain function table
pub struct PresentationHook {
    id: u32,
    engine: Arc<VTableHookEngine>,
    state: HookState,
    table: Option<usize>,
    callback: Option<PresentCallback>,
}

impl PresentationHook {
    pub fn new(engine: Arc<VTableHookEngine>) -> Self {
        Self {
            id: next_instance_id(),
            engine,
            state: HookState::Uninstalled,
            table: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: PresentCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Replace the callback; takes effect on the next present
    pub fn set_callback(&mut self, callback: Option<PresentCallback>) {
        self.callback = callback;
        if self.state == HookState::Installed {
            let mut active = ACTIVE_PRESENT.write();
            if let Some(dispatch) = active.as_mut().filter(|d| d.owner == self.id) {
                dispatch.callback = self.callback.clone();
            }
        }
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    pub fn is_installed(&self) -> bool {
        self.state == HookState::Installed
    }

    pub fn hooked_table(&self) -> Option<usize> {
        self.table
    }

    /// Hook the present slot of `swap_chain`'s table.
    ///
    /// Installing on a swap chain that shares the hooked table is a no-op.
    /// A different table replaces the current hook.
    ///
    /// # Safety
    /// `swap_chain` must point to a live swap chain.
    pub unsafe fn install(&mut self, swap_chain: *mut c_void) -> Result<()> {
        let table = VTableHookEngine::get_table(swap_chain)
            .ok_or(Error::InvalidAddress(swap_chain as usize))?;

        if self.state == HookState::Installed {
            if self.table == Some(table) {
                debug!(
                    target: "framelink_core::present_hook",
                    table = format_args!("{:#x}", table),
                    "Present already hooked on this table"
                );
                return Ok(());
            }
            info!(
                target: "framelink_core::present_hook",
                old = format_args!("{:#x}", self.table.unwrap_or(0)),
                new = format_args!("{:#x}", table),
                "Swap chain table changed, moving present hook"
            );
            self.remove()?;
        }

        let mut active = ACTIVE_PRESENT.write();
        if let Some(other) = active.as_ref() {
            if other.owner != self.id {
                return Err(Error::HookInstall(
                    "another presentation hook is already active in this process".into(),
                ));
            }
        }

        let record = self.engine.install(
            table,
            SWAP_CHAIN_PRESENT_INDEX,
            present_thunk as usize,
        )?;

        if record.original == present_thunk as usize || record.original == 0 {
            return Err(Error::HookInstall(format!(
                "present slot of table {:#x} holds no usable original",
                table
            )));
        }

        let original: PresentFn = std::mem::transmute::<usize, PresentFn>(record.original);
        LAST_ORIGINAL.store(record.original, Ordering::SeqCst);
        *active = Some(ActiveDispatch {
            owner: self.id,
            original,
            callback: self.callback.clone(),
        });

        self.table = Some(table);
        self.state = HookState::Installed;

        info!(
            target: "framelink_core::present_hook",
            table = format_args!("{:#x}", table),
            original = format_args!("{:#x}", record.original),
            "Present hook installed"
        );
        Ok(())
    }

    /// Put the original present back. Callers must have quiesced presents
    /// through the hooked table first.
    pub fn remove(&mut self) -> Result<()> {
        let Some(table) = self.table else {
            return Ok(());
        };

        // SAFETY: the table was live at install time and swap-chain tables
        // live in dxgi's image, which outlives its objects.
        unsafe { self.engine.remove(table, SWAP_CHAIN_PRESENT_INDEX)? };

        let mut active = ACTIVE_PRESENT.write();
        if active.as_ref().map(|d| d.owner) == Some(self.id) {
            *active = None;
        }

        self.table = None;
        self.state = HookState::Uninstalled;
        info!(
            target: "framelink_core::present_hook",
            table = format_args!("{:#x}", table),
            "Present hook removed"
        );
        Ok(())
    }

    /// Create a throwaway swap chain on a hidden window and hook its table.
    ///
    /// Every swap chain of the same class shares that table, so the hook
    /// outlives the throwaway object.
    #[cfg(target_os = "windows")]
    pub fn discover(&mut self) -> Result<()> {
        let probe = probe::ProbeSwapChain::create()?;
        // SAFETY: the probe keeps the swap chain alive for this call.
        unsafe { self.install(probe.as_raw()) }
    }

    #[cfg(not(target_os = "windows"))]
    pub fn discover(&mut self) -> Result<()> {
        Err(Error::NotImplemented(
            "Swap chain discovery only supported on Windows".into(),
        ))
    }
}

impl Drop for PresentationHook {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(
                target: "framelink_core::present_hook",
                error = %e,
                "Present hook not restored on drop"
            );
        }
    }
}

#[cfg(target_os = "windows")]
mod probe {
    use framelink_common::{Error, Result};
    use std::ffi::c_void;
    use windows::core::{w, Interface};
    use windows::Win32::Foundation::{HMODULE, HWND, TRUE};
    use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
    use windows::Win32::Graphics::Direct3D11::{
        D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11DeviceContext,
        D3D11_CREATE_DEVICE_FLAG, D3D11_SDK_VERSION,
    };
    use windows::Win32::Graphics::Dxgi::Common::{
        DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_RATIONAL, DXGI_SAMPLE_DESC,
    };
    use windows::Win32::Graphics::Dxgi::{
        IDXGISwapChain, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
        DXGI_USAGE_RENDER_TARGET_OUTPUT,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DestroyWindow, WINDOW_EX_STYLE, WS_OVERLAPPED,
    };

    /// Hidden window plus a swap chain bound to it, torn down on drop
    pub struct ProbeSwapChain {
        window: HWND,
        swap_chain: IDXGISwapChain,
        _device: ID3D11Device,
        _context: ID3D11DeviceContext,
    }

    impl ProbeSwapChain {
        pub fn create() -> Result<Self> {
            let window = unsafe {
                CreateWindowExW(
                    WINDOW_EX_STYLE(0),
                    w!("STATIC"),
                    w!("framelink-probe"),
                    WS_OVERLAPPED,
                    0,
                    0,
                    64,
                    64,
                    None,
                    None,
                    None,
                    None,
                )
            }
            .map_err(|e| Error::HookInstall(format!("Probe window creation failed: {}", e)))?;

            let desc = DXGI_SWAP_CHAIN_DESC {
                BufferDesc: DXGI_MODE_DESC {
                    Width: 64,
                    Height: 64,
                    RefreshRate: DXGI_RATIONAL {
                        Numerator: 60,
                        Denominator: 1,
                    },
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ..Default::default()
                },
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: 1,
                OutputWindow: window,
                Windowed: TRUE,
                SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
                Flags: 0,
            };

            let mut swap_chain: Option<IDXGISwapChain> = None;
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;

            let created = unsafe {
                D3D11CreateDeviceAndSwapChain(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    HMODULE::default(),
                    D3D11_CREATE_DEVICE_FLAG(0),
                    None,
                    D3D11_SDK_VERSION,
                    Some(&desc),
                    Some(&mut swap_chain),
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
            };

            let destroy = || unsafe {
                let _ = DestroyWindow(window);
            };

            if let Err(e) = created {
                destroy();
                return Err(Error::HookInstall(format!(
                    "Probe swap chain creation failed: {}",
                    e
                )));
            }

            match (swap_chain, device, context) {
                (Some(swap_chain), Some(device), Some(context)) => Ok(Self {
                    window,
                    swap_chain,
                    _device: device,
                    _context: context,
                }),
                _ => {
                    destroy();
                    Err(Error::HookInstall(
                        "Probe swap chain creation returned no objects".into(),
                    ))
                }
            }
        }

        pub fn as_raw(&self) -> *mut c_void {
            self.swap_chain.as_raw()
        }
    }

    impl Drop for ProbeSwapChain {
        fn drop(&mut self) {
            unsafe {
                let _ = DestroyWindow(self.window);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::DISPATCH_LOCK;
    use super::*;
    use crate::vtable::fake::FakeObject;
    use std::sync::atomic::AtomicU32;

    static ORIGINAL_CALLS: AtomicU32 = AtomicU32::new(0);
    static LAST_ARGS: AtomicU64 = AtomicU64::new(0);

    unsafe extern "system" fn fake_present(_this: *mut c_void, sync: u32, flags: u32) -> i32 {
        ORIGINAL_CALLS.fetch_add(1, Ordering::SeqCst);
        LAST_ARGS.store(((sync as u64) << 32) | flags as u64, Ordering::SeqCst);
        0x0087_A001
    }

    fn fake_swap_chain() -> FakeObject {
        let mut obj = FakeObject::with_slots(18, 0);
        obj.set_slot(SWAP_CHAIN_PRESENT_INDEX, fake_present as usize);
        obj
    }

    fn call_present(obj: &FakeObject, sync: u32, flags: u32) -> i32 {
        let f: PresentFn =
            unsafe { std::mem::transmute::<usize, PresentFn>(obj.slot(SWAP_CHAIN_PRESENT_INDEX)) };
        unsafe { f(obj.ptr(), sync, flags) }
    }

    #[test]
    fn test_dispatch_calls_callback_then_original() {
        let _guard = DISPATCH_LOCK.lock();
        let swap_chain = fake_swap_chain();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();

        let mut hook = PresentationHook::new(Arc::new(VTableHookEngine::new())).with_callback(
            Arc::new(move |sc: *mut c_void| {
                seen_cb.store(sc as usize, Ordering::SeqCst);
            }),
        );
        unsafe { hook.install(swap_chain.ptr()).unwrap() };
        assert!(hook.is_installed());
        assert_eq!(swap_chain.slot(SWAP_CHAIN_PRESENT_INDEX), present_thunk as usize);

        let before = ORIGINAL_CALLS.load(Ordering::SeqCst);
        let hr = call_present(&swap_chain, 1, 0x200);
        assert_eq!(hr, 0x0087_A001);
        assert_eq!(ORIGINAL_CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(LAST_ARGS.load(Ordering::SeqCst), (1u64 << 32) | 0x200);
        assert_eq!(seen.load(Ordering::SeqCst), swap_chain.ptr() as usize);

        hook.remove().unwrap();
        assert_eq!(swap_chain.slot(SWAP_CHAIN_PRESENT_INDEX), fake_present as usize);
        assert!(!hook.is_installed());
    }

    #[test]
    fn test_panicking_callback_still_forwards() {
        let _guard = DISPATCH_LOCK.lock();
        let swap_chain = fake_swap_chain();
        let mut hook = PresentationHook::new(Arc::new(VTableHookEngine::new()))
            .with_callback(Arc::new(|_| panic!("capture exploded")));
        unsafe { hook.install(swap_chain.ptr()).unwrap() };

        let failures = callback_failures();
        let before = ORIGINAL_CALLS.load(Ordering::SeqCst);
        let hr = call_present(&swap_chain, 0, 0);
        assert_eq!(hr, 0x0087_A001);
        assert_eq!(ORIGINAL_CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(callback_failures(), failures + 1);
    }

    #[test]
    fn test_second_instance_refused() {
        let _guard = DISPATCH_LOCK.lock();
        let engine = Arc::new(VTableHookEngine::new());
        let a = fake_swap_chain();
        let b = fake_swap_chain();

        let mut first = PresentationHook::new(engine.clone());
        let mut second = PresentationHook::new(engine);
        unsafe { first.install(a.ptr()).unwrap() };
        let err = unsafe { second.install(b.ptr()) }.unwrap_err();
        assert!(matches!(err, Error::HookInstall(_)));
        assert_eq!(b.slot(SWAP_CHAIN_PRESENT_INDEX), fake_present as usize);

        drop(first);
        assert_eq!(a.slot(SWAP_CHAIN_PRESENT_INDEX), fake_present as usize);
        unsafe { second.install(b.ptr()).unwrap() };
        assert!(second.is_installed());
    }

    #[test]
    fn test_new_table_replaces_hook() {
        let _guard = DISPATCH_LOCK.lock();
        let a = fake_swap_chain();
        let b = fake_swap_chain();
        let mut hook = PresentationHook::new(Arc::new(VTableHookEngine::new()));

        unsafe { hook.install(a.ptr()).unwrap() };
        unsafe { hook.install(b.ptr()).unwrap() };

        assert_eq!(hook.hooked_table(), Some(b.table_addr()));
        assert_eq!(a.slot(SWAP_CHAIN_PRESENT_INDEX), fake_present as usize);
        assert_eq!(b.slot(SWAP_CHAIN_PRESENT_INDEX), present_thunk as usize);
    }

    #[test]
    fn test_same_table_is_noop() {
        let _guard = DISPATCH_LOCK.lock();
        let a = fake_swap_chain();
        let engine = Arc::new(VTableHookEngine::new());
        let mut hook = PresentationHook::new(engine.clone());

        unsafe { hook.install(a.ptr()).unwrap() };
        unsafe { hook.install(a.ptr()).unwrap() };
        assert_eq!(engine.hook_count(), 1);
        let record = engine
            .record(a.table_addr(), SWAP_CHAIN_PRESENT_INDEX)
            .unwrap();
        assert_eq!(record.original, fake_present as usize);
    }

    #[test]
    fn test_set_callback_after_install() {
        let _guard = DISPATCH_LOCK.lock();
        let a = fake_swap_chain();
        let mut hook = PresentationHook::new(Arc::new(VTableHookEngine::new()));
        unsafe { hook.install(a.ptr()).unwrap() };

        let hits = Arc::new(AtomicU32::new(0));
        let hits_cb = hits.clone();
        hook.set_callback(Some(Arc::new(move |_: *mut c_void| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        })));

        call_present(&a, 0, 0);
        call_present(&a, 0, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_null_swap_chain_rejected() {
        let _guard = DISPATCH_LOCK.lock();
        let mut hook = PresentationHook::new(Arc::new(VTableHookEngine::new()));
        assert!(unsafe { hook.install(std::ptr::null_mut()) }.is_err());
        assert_eq!(hook.state(), HookState::Uninstalled);
    }
}
