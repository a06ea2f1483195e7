//! Runtime discovery of swap chains through their creation paths
//!
//! The factory and device creation exports are redirected to thunks here.
//! Each factory they produce gets its swap-chain creation slots hooked, and
//! every swap chain that comes out of any of these paths is handed to the
//! [`PresentationHook`]. Like the present hook, the thunks carry no
//! context, so one interceptor per process is the dispatch target.

use crate::export_hooks::{loaded_module_bases, ExportHookManager};
use crate::hook_set::HookSet;
use crate::pattern_scanner::SignatureScanner;
use crate::present_hook::{PresentationHook, E_FAIL};
use crate::signatures::{
    self, D3D11_MODULE, DXGI_MODULE, FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX,
    FACTORY_CREATE_SWAP_CHAIN_INDEX,
};
use crate::vtable::VTableHookEngine;
use framelink_common::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type SharedPresentationHook = Arc<Mutex<PresentationHook>>;

/// `CreateDXGIFactory` / `CreateDXGIFactory1(REFIID, void**)`
pub type CreateFactoryFn = unsafe extern "system" fn(*const c_void, *mut *mut c_void) -> i32;
/// `CreateDXGIFactory2(UINT, REFIID, void**)`
pub type CreateFactory2Fn = unsafe extern "system" fn(u32, *const c_void, *mut *mut c_void) -> i32;
/// `D3D11CreateDevice`
pub type CreateDeviceFn = unsafe extern "system" fn(
    *mut c_void,
    i32,
    *mut c_void,
    u32,
    *const i32,
    u32,
    u32,
    *mut *mut c_void,
    *mut i32,
    *mut *mut c_void,
) -> i32;
/// `D3D11CreateDeviceAndSwapChain`
pub type CreateDeviceAndSwapChainFn = unsafe extern "system" fn(
    *mut c_void,
    i32,
    *mut c_void,
    u32,
    *const i32,
    u32,
    u32,
    *const c_void,
    *mut *mut c_void,
    *mut *mut c_void,
    *mut i32,
    *mut *mut c_void,
) -> i32;
/// `IDXGIFactory::CreateSwapChain(this, device, desc, out)`
pub type CreateSwapChainFn =
    unsafe extern "system" fn(*mut c_void, *mut c_void, *mut c_void, *mut *mut c_void) -> i32;
/// `IDXGIFactory2::CreateSwapChainForHwnd(this, device, hwnd, desc, fullscreen, output, out)`
pub type CreateSwapChainForHwndFn = unsafe extern "system" fn(
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *mut *mut c_void,
) -> i32;

/// Function table of the factory's newer interface, when it has one
pub type Factory2Probe = fn(*mut c_void) -> Option<usize>;

/// Calls `visit` with the factory that owns `device`, if it can be found
pub type DeviceFactoryProbe = fn(*mut c_void, &mut dyn FnMut(*mut c_void));

/// Creation exports routed through this module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationExport {
    CreateFactory,
    CreateFactory1,
    CreateFactory2,
    CreateDevice,
    CreateDeviceAndSwapChain,
}

impl CreationExport {
    pub const ALL: [CreationExport; 5] = [
        Self::CreateFactory,
        Self::CreateFactory1,
        Self::CreateFactory2,
        Self::CreateDevice,
        Self::CreateDeviceAndSwapChain,
    ];

    pub fn module(self) -> &'static str {
        match self {
            Self::CreateFactory | Self::CreateFactory1 | Self::CreateFactory2 => DXGI_MODULE,
            Self::CreateDevice | Self::CreateDeviceAndSwapChain => D3D11_MODULE,
        }
    }

    pub fn function(self) -> &'static str {
        match self {
            Self::CreateFactory => "CreateDXGIFactory",
            Self::CreateFactory1 => "CreateDXGIFactory1",
            Self::CreateFactory2 => "CreateDXGIFactory2",
            Self::CreateDevice => "D3D11CreateDevice",
            Self::CreateDeviceAndSwapChain => "D3D11CreateDeviceAndSwapChain",
        }
    }

    fn thunk(self) -> usize {
        match self {
            Self::CreateFactory => create_factory_thunk as usize,
            Self::CreateFactory1 => create_factory1_thunk as usize,
            Self::CreateFactory2 => create_factory2_thunk as usize,
            Self::CreateDevice => create_device_thunk as usize,
            Self::CreateDeviceAndSwapChain => create_device_and_swap_chain_thunk as usize,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct FactoryEntry {
    create_swap_chain: usize,
    /// Table and original of the newer interface's slot
    create_for_hwnd: Option<(usize, usize)>,
}

struct InterceptorShared {
    engine: Arc<VTableHookEngine>,
    present: SharedPresentationHook,
    /// Hooked factory function table to the originals its slots held.
    /// Factories of one class share a table, so this stays small however
    /// many factories the host creates and releases.
    factories: Mutex<HashMap<usize, FactoryEntry>>,
    factories_seen: AtomicU64,
    export_originals: [AtomicUsize; 5],
    factory2_probe: Factory2Probe,
    device_probe: DeviceFactoryProbe,
    swap_chains_seen: AtomicU64,
}

/// Current dispatch target for the creation thunks
static INTERCEPTOR: Lazy<RwLock<Option<Arc<InterceptorShared>>>> = Lazy::new(|| RwLock::new(None));

fn current() -> Option<Arc<InterceptorShared>> {
    INTERCEPTOR.read().clone()
}

/// Originals kept after removal for callers that resolved a thunk while
/// it was installed
static LAST_EXPORT_ORIGINALS: [AtomicUsize; 5] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

/// `(table, slot)` to the original it held, for the same callers
static LAST_FACTORY_ORIGINALS: Lazy<RwLock<HashMap<(usize, usize), usize>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn export_original(shared: Option<&InterceptorShared>, export: CreationExport) -> Option<usize> {
    shared
        .and_then(|shared| shared.export_original(export))
        .or_else(|| match LAST_EXPORT_ORIGINALS[export.index()].load(Ordering::SeqCst) {
            0 => None,
            address => Some(address),
        })
}

unsafe fn factory_original(
    shared: Option<&InterceptorShared>,
    factory: *mut c_void,
    index: usize,
) -> Option<usize> {
    if let Some(original) = shared.and_then(|shared| shared.factory_original(factory, index)) {
        return Some(original);
    }
    let table = VTableHookEngine::get_table(factory)?;
    LAST_FACTORY_ORIGINALS.read().get(&(table, index)).copied()
}

impl InterceptorShared {
    fn export_original(&self, export: CreationExport) -> Option<usize> {
        match self.export_originals[export.index()].load(Ordering::SeqCst) {
            0 => None,
            address => Some(address),
        }
    }

    fn set_export_original(&self, export: CreationExport, address: usize) {
        self.export_originals[export.index()].store(address, Ordering::SeqCst);
        LAST_EXPORT_ORIGINALS[export.index()].store(address, Ordering::SeqCst);
    }

    /// Hook the swap-chain creation slots of `factory`'s table once
    unsafe fn adopt_factory(&self, factory: *mut c_void) {
        let Some(table) = VTableHookEngine::get_table(factory) else {
            return;
        };
        self.factories_seen.fetch_add(1, Ordering::Relaxed);

        let mut factories = self.factories.lock();
        if factories.contains_key(&table) {
            return;
        }

        let record = match self.engine.install(
            table,
            FACTORY_CREATE_SWAP_CHAIN_INDEX,
            create_swap_chain_thunk as usize,
        ) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    target: "framelink_core::factory_hooks",
                    factory = format_args!("{:#x}", factory as usize),
                    error = %e,
                    "Factory not hooked"
                );
                return;
            }
        };

        let create_for_hwnd = (self.factory2_probe)(factory).and_then(|table2| {
            self.engine
                .install(
                    table2,
                    FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX,
                    create_swap_chain_for_hwnd_thunk as usize,
                )
                .map(|r| (table2, r.original))
                .map_err(|e| {
                    warn!(
                        target: "framelink_core::factory_hooks",
                        error = %e,
                        "CreateSwapChainForHwnd not hooked"
                    )
                })
                .ok()
        });

        {
            let mut last = LAST_FACTORY_ORIGINALS.write();
            last.insert((table, FACTORY_CREATE_SWAP_CHAIN_INDEX), record.original);
            if let Some((table2, original)) = create_for_hwnd {
                last.insert((table2, FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX), original);
            }
        }
        factories.insert(
            table,
            FactoryEntry {
                create_swap_chain: record.original,
                create_for_hwnd,
            },
        );

        debug!(
            target: "framelink_core::factory_hooks",
            factory = format_args!("{:#x}", factory as usize),
            table = format_args!("{:#x}", table),
            hwnd_variant = create_for_hwnd.is_some(),
            "Factory adopted"
        );
    }

    /// Original of one factory slot for the factory making the call
    unsafe fn factory_original(&self, factory: *mut c_void, index: usize) -> Option<usize> {
        let table = VTableHookEngine::get_table(factory)?;
        if index == FACTORY_CREATE_SWAP_CHAIN_INDEX {
            if let Some(entry) = self.factories.lock().get(&table) {
                return Some(entry.create_swap_chain);
            }
        }
        // The newer interface's table, or a slot hooked some other way
        self.engine.record(table, index).map(|r| r.original)
    }

    unsafe fn adopt_swap_chain(&self, swap_chain: *mut c_void) {
        if swap_chain.is_null() {
            return;
        }
        self.swap_chains_seen.fetch_add(1, Ordering::Relaxed);

        // The hook may be held by the thread that created this swap chain
        let Some(mut hook) = self.present.try_lock_for(Duration::from_millis(50)) else {
            debug!(
                target: "framelink_core::factory_hooks",
                swap_chain = format_args!("{:#x}", swap_chain as usize),
                "Presentation hook busy, swap chain skipped"
            );
            return;
        };
        if let Err(e) = hook.install(swap_chain) {
            warn!(
                target: "framelink_core::factory_hooks",
                swap_chain = format_args!("{:#x}", swap_chain as usize),
                error = %e,
                "Swap chain not hooked"
            );
        }
    }

    unsafe fn adopt_device(&self, device: *mut c_void) {
        if device.is_null() {
            return;
        }
        (self.device_probe)(device, &mut |factory| self.adopt_factory(factory));
    }
}

unsafe fn out_value(out: *mut *mut c_void) -> *mut c_void {
    if out.is_null() {
        std::ptr::null_mut()
    } else {
        *out
    }
}

unsafe extern "system" fn create_factory_thunk(riid: *const c_void, out: *mut *mut c_void) -> i32 {
    let shared = current();
    let Some(original) = export_original(shared.as_deref(), CreationExport::CreateFactory) else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateFactoryFn>(original);
    let hr = original(riid, out);
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_factory(out_value(out));
    }
    hr
}

unsafe extern "system" fn create_factory1_thunk(riid: *const c_void, out: *mut *mut c_void) -> i32 {
    let shared = current();
    let Some(original) = export_original(shared.as_deref(), CreationExport::CreateFactory1) else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateFactoryFn>(original);
    let hr = original(riid, out);
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_factory(out_value(out));
    }
    hr
}

unsafe extern "system" fn create_factory2_thunk(
    flags: u32,
    riid: *const c_void,
    out: *mut *mut c_void,
) -> i32 {
    let shared = current();
    let Some(original) = export_original(shared.as_deref(), CreationExport::CreateFactory2) else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateFactory2Fn>(original);
    let hr = original(flags, riid, out);
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_factory(out_value(out));
    }
    hr
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn create_device_thunk(
    adapter: *mut c_void,
    driver_type: i32,
    software: *mut c_void,
    flags: u32,
    feature_levels: *const i32,
    num_levels: u32,
    sdk_version: u32,
    device: *mut *mut c_void,
    feature_level: *mut i32,
    context: *mut *mut c_void,
) -> i32 {
    let shared = current();
    let Some(original) = export_original(shared.as_deref(), CreationExport::CreateDevice) else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateDeviceFn>(original);
    let hr = original(
        adapter,
        driver_type,
        software,
        flags,
        feature_levels,
        num_levels,
        sdk_version,
        device,
        feature_level,
        context,
    );
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_device(out_value(device));
    }
    hr
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn create_device_and_swap_chain_thunk(
    adapter: *mut c_void,
    driver_type: i32,
    software: *mut c_void,
    flags: u32,
    feature_levels: *const i32,
    num_levels: u32,
    sdk_version: u32,
    swap_chain_desc: *const c_void,
    swap_chain: *mut *mut c_void,
    device: *mut *mut c_void,
    feature_level: *mut i32,
    context: *mut *mut c_void,
) -> i32 {
    let shared = current();
    let Some(original) = export_original(shared.as_deref(), CreationExport::CreateDeviceAndSwapChain) else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateDeviceAndSwapChainFn>(original);
    let hr = original(
        adapter,
        driver_type,
        software,
        flags,
        feature_levels,
        num_levels,
        sdk_version,
        swap_chain_desc,
        swap_chain,
        device,
        feature_level,
        context,
    );
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_device(out_value(device));
        shared.adopt_swap_chain(out_value(swap_chain));
    }
    hr
}

unsafe extern "system" fn create_swap_chain_thunk(
    factory: *mut c_void,
    device: *mut c_void,
    desc: *mut c_void,
    out: *mut *mut c_void,
) -> i32 {
    let shared = current();
    let Some(original) = factory_original(shared.as_deref(), factory, FACTORY_CREATE_SWAP_CHAIN_INDEX)
    else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateSwapChainFn>(original);
    let hr = original(factory, device, desc, out);
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_swap_chain(out_value(out));
    }
    hr
}

unsafe extern "system" fn create_swap_chain_for_hwnd_thunk(
    factory: *mut c_void,
    device: *mut c_void,
    hwnd: *mut c_void,
    desc: *const c_void,
    fullscreen_desc: *const c_void,
    restrict_output: *mut c_void,
    out: *mut *mut c_void,
) -> i32 {
    let shared = current();
    let Some(original) =
        factory_original(shared.as_deref(), factory, FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX)
    else {
        return E_FAIL;
    };
    let original = std::mem::transmute::<usize, CreateSwapChainForHwndFn>(original);
    let hr = original(factory, device, hwnd, desc, fullscreen_desc, restrict_output, out);
    if let Some(shared) = shared.as_deref().filter(|_| hr >= 0) {
        shared.adopt_swap_chain(out_value(out));
    }
    hr
}

#[cfg(target_os = "windows")]
fn default_factory2_probe(factory: *mut c_void) -> Option<usize> {
    use windows::core::Interface;
    use windows::Win32::Graphics::Dxgi::{IDXGIFactory, IDXGIFactory2};

    // SAFETY: called with a factory the runtime just handed out.
    let factory = unsafe { IDXGIFactory::from_raw_borrowed(&factory) }?;
    let factory2: IDXGIFactory2 = factory.cast().ok()?;
    // The table lives in dxgi's image and outlives this reference.
    unsafe { VTableHookEngine::get_table(factory2.as_raw()) }
}

#[cfg(not(target_os = "windows"))]
fn default_factory2_probe(_factory: *mut c_void) -> Option<usize> {
    None
}

#[cfg(target_os = "windows")]
fn default_device_probe(device: *mut c_void, visit: &mut dyn FnMut(*mut c_void)) {
    use windows::core::{IUnknown, Interface};
    use windows::Win32::Graphics::Dxgi::{IDXGIDevice, IDXGIFactory};

    // SAFETY: called with a device the runtime just handed out.
    let Some(device) = (unsafe { IUnknown::from_raw_borrowed(&device) }) else {
        return;
    };
    let Ok(dxgi_device) = device.cast::<IDXGIDevice>() else {
        return;
    };
    let Ok(adapter) = (unsafe { dxgi_device.GetAdapter() }) else {
        return;
    };
    let Ok(factory) = (unsafe { adapter.GetParent::<IDXGIFactory>() }) else {
        return;
    };
    visit(factory.as_raw());
}

#[cfg(not(target_os = "windows"))]
fn default_device_probe(_device: *mut c_void, _visit: &mut dyn FnMut(*mut c_void)) {}

/// Hooks the creation exports and every factory they produce
pub struct FactoryInterceptor {
    shared: Arc<InterceptorShared>,
    exports: ExportHookManager,
    use_signatures: bool,
    installed: bool,
}

impl FactoryInterceptor {
    pub fn new(engine: Arc<VTableHookEngine>, present: SharedPresentationHook) -> Self {
        Self {
            shared: Arc::new(InterceptorShared {
                engine,
                present,
                factories: Mutex::new(HashMap::new()),
                factories_seen: AtomicU64::new(0),
                export_originals: Default::default(),
                factory2_probe: default_factory2_probe,
                device_probe: default_device_probe,
                swap_chains_seen: AtomicU64::new(0),
            }),
            exports: ExportHookManager::new(),
            use_signatures: true,
            installed: false,
        }
    }

    /// Fall back to the signature table when an export is missing
    pub fn with_signatures(mut self, enabled: bool) -> Self {
        self.use_signatures = enabled;
        self
    }

    pub fn with_factory2_probe(mut self, probe: Factory2Probe) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.factory2_probe = probe;
        }
        self
    }

    pub fn with_device_probe(mut self, probe: DeviceFactoryProbe) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.device_probe = probe;
        }
        self
    }

    fn hook_creation_export(&self, export: CreationExport) -> Result<()> {
        let (module, function) = (export.module(), export.function());

        match self.exports.resolve_export(module, function) {
            Ok(original) => {
                // Published before the patch so the thunk never sees zero
                self.shared.set_export_original(export, original);
                self.exports.hook_export(module, function, export.thunk())?;
                Ok(())
            }
            Err(e) if self.use_signatures => {
                let signature = signatures::find(function).ok_or(e)?;
                let original = SignatureScanner::new().session()?.find_signature(signature)?;
                self.shared.set_export_original(export, original);
                // SAFETY: bases come from the loader's module list.
                unsafe {
                    self.exports.hook_imports(
                        module,
                        function,
                        original,
                        export.thunk(),
                        &loaded_module_bases(),
                    )?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Hook the swap-chain creation slots of a factory obtained elsewhere
    ///
    /// # Safety
    /// `factory` must be a live factory object.
    pub unsafe fn adopt_factory(&self, factory: *mut c_void) {
        self.shared.adopt_factory(factory);
    }

    /// Hand a swap chain obtained elsewhere to the presentation hook
    ///
    /// # Safety
    /// `swap_chain` must be a live swap chain.
    pub unsafe fn adopt_swap_chain(&self, swap_chain: *mut c_void) {
        self.shared.adopt_swap_chain(swap_chain);
    }

    /// Distinct factory function tables hooked
    pub fn hooked_factory_tables(&self) -> usize {
        self.shared.factories.lock().len()
    }

    /// Factories reported by any creation path or adopted directly
    pub fn factories_seen(&self) -> u64 {
        self.shared.factories_seen.load(Ordering::Relaxed)
    }

    pub fn hooked_exports(&self) -> usize {
        self.exports.hook_count()
    }

    /// Swap chains reported by any creation path so far
    pub fn swap_chains_seen(&self) -> u64 {
        self.shared.swap_chains_seen.load(Ordering::Relaxed)
    }
}

impl HookSet for FactoryInterceptor {
    fn name(&self) -> &'static str {
        "factory"
    }

    fn install_hooks(&mut self) -> Result<()> {
        if self.installed {
            return Ok(());
        }

        {
            let mut slot = INTERCEPTOR.write();
            if let Some(other) = slot.as_ref() {
                if !Arc::ptr_eq(other, &self.shared) {
                    return Err(Error::HookInstall(
                        "another factory interceptor is already active in this process".into(),
                    ));
                }
            }
            *slot = Some(self.shared.clone());
        }

        for export in CreationExport::ALL {
            if let Err(e) = self.hook_creation_export(export) {
                if e.is_discovery() {
                    debug!(
                        target: "framelink_core::factory_hooks",
                        function = export.function(),
                        error = %e,
                        "Creation export unavailable"
                    );
                } else {
                    warn!(
                        target: "framelink_core::factory_hooks",
                        function = export.function(),
                        error = %e,
                        "Creation export not hooked"
                    );
                }
            }
        }

        self.installed = true;
        let hooked = self.exports.hook_count();
        if hooked == 0 {
            warn!(
                target: "framelink_core::factory_hooks",
                "No creation exports hooked, only adopted factories will be seen"
            );
        } else {
            info!(
                target: "framelink_core::factory_hooks",
                hooked,
                "Factory interception active"
            );
        }
        Ok(())
    }

    fn remove_hooks(&mut self) -> Result<()> {
        if !self.installed {
            return Ok(());
        }

        self.exports.unhook_all();

        let entries: Vec<(usize, FactoryEntry)> = self.shared.factories.lock().drain().collect();
        let mut slots: Vec<(usize, usize)> = Vec::new();
        for (table, entry) in entries {
            slots.push((table, FACTORY_CREATE_SWAP_CHAIN_INDEX));
            if let Some((table2, _)) = entry.create_for_hwnd {
                slots.push((table2, FACTORY_CREATE_SWAP_CHAIN_FOR_HWND_INDEX));
            }
        }
        slots.sort_unstable();
        slots.dedup();
        for (table, index) in slots {
            // SAFETY: factory tables live in dxgi's image.
            if let Err(e) = unsafe { self.shared.engine.remove(table, index) } {
                warn!(
                    target: "framelink_core::factory_hooks",
                    table = format_args!("{:#x}", table),
                    index,
                    error = %e,
                    "Factory slot not restored"
                );
            }
        }

        {
            let mut slot = INTERCEPTOR.write();
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &self.shared)) {
                *slot = None;
            }
        }

        self.installed = false;
        info!(target: "framelink_core::factory_hooks", "Factory interception removed");
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}

impl Drop for FactoryInterceptor {
    fn drop(&mut self) {
        if let Err(e) = self.remove_hooks() {
            warn!(
                target: "framelink_core::factory_hooks",
                error = %e,
                "Factory interception not removed on drop"
            );
        }
    }
}
