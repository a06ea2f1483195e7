//! Export-table hooks
//!
//! Redirects a DLL export for everyone who resolves it after the hook
//! (GetProcAddress reads the export address table) and for modules that
//! already bound it (their import address table cells are patched too).
//! Export RVAs are 32-bit, so the export entry points at a relay stub
//! allocated above the module that jumps to the detour.

use crate::memory;
use crate::patch::{self, PageProtection, RelayStub};
use crate::pe;
use framelink_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One redirected export
#[derive(Debug)]
pub struct ExportHook {
    pub module: String,
    pub function: String,
    /// Address callers reached before the hook
    pub original: usize,
    pub detour: usize,
    /// Patched export-table cell and the RVA it held
    eat: Option<(usize, u32)>,
    relay: Option<RelayStub>,
    /// Patched import cells, each held `original` before
    iat_slots: Vec<usize>,
}

impl ExportHook {
    pub fn patched_imports(&self) -> usize {
        self.iat_slots.len()
    }

    pub fn patched_export_table(&self) -> bool {
        self.eat.is_some()
    }
}

fn hook_key(module: &str, function: &str) -> String {
    format!("{}!{}", module.to_ascii_lowercase(), function)
}

pub struct ExportHookManager {
    protection: Arc<dyn PageProtection>,
    hooks: Mutex<HashMap<String, ExportHook>>,
}

impl Default for ExportHookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportHookManager {
    pub fn new() -> Self {
        Self::with_protection(patch::system_protection())
    }

    pub fn with_protection(protection: Arc<dyn PageProtection>) -> Self {
        Self {
            protection,
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Current address of an export of a loaded module
    pub fn resolve_export(&self, module: &str, function: &str) -> Result<usize> {
        let (base, _) = memory::module_range(module)?;
        // SAFETY: module_range only reports images mapped by the loader.
        let slot = unsafe { pe::export_slot(base, function)? };
        Ok(base + slot.rva as usize)
    }

    /// Hook `module!function` so that it lands on `detour`, returning the
    /// original address.
    pub fn hook_export(&self, module: &str, function: &str, detour: usize) -> Result<usize> {
        if let Some(original) = self.original(module, function) {
            return Ok(original);
        }

        let (base, _) = memory::module_range(module)?;
        let relay = patch::allocate_relay(base, detour)?;
        let importers = loaded_module_bases();

        // SAFETY: base is a loader-mapped image; importers come from the
        // same module list.
        unsafe { self.hook_export_with(module, base, function, relay, &importers) }
    }

    /// Hook an export of the image at `base` through an already placed relay.
    ///
    /// # Safety
    /// `base` and every entry of `importers` must be mapped PE images, and
    /// `relay` must point at executable code jumping to `relay.target`.
    pub unsafe fn hook_export_with(
        &self,
        module: &str,
        base: usize,
        function: &str,
        relay: RelayStub,
        importers: &[usize],
    ) -> Result<usize> {
        let key = hook_key(module, function);
        let mut hooks = self.hooks.lock();
        if let Some(existing) = hooks.get(&key) {
            patch::free_relay(relay);
            return Ok(existing.original);
        }

        let slot = match pe::export_slot(base, function) {
            Ok(slot) => slot,
            Err(e) => {
                patch::free_relay(relay);
                return Err(e);
            }
        };
        let Some(relay_rva) = relay.rva_from(base) else {
            let address = relay.address;
            patch::free_relay(relay);
            return Err(Error::HookInstall(format!(
                "Relay {:#x} not reachable from {} base {:#x}",
                address, module, base
            )));
        };

        let original = base + slot.rva as usize;
        if let Err(e) = patch::swap_u32(self.protection.as_ref(), slot.entry, relay_rva) {
            patch::free_relay(relay);
            return Err(e);
        }

        let detour = relay.target;
        let iat_slots = self.patch_imports(importers, module, function, original, detour);

        info!(
            target: "framelink_core::export_hooks",
            module,
            function,
            original = format_args!("{:#x}", original),
            detour = format_args!("{:#x}", detour),
            imports = iat_slots.len(),
            "Export hooked"
        );

        hooks.insert(
            key,
            ExportHook {
                module: module.to_string(),
                function: function.to_string(),
                original,
                detour,
                eat: Some((slot.entry, slot.rva)),
                relay: Some(relay),
                iat_slots,
            },
        );
        Ok(original)
    }

    /// Redirect only already-bound imports of a function found some other
    /// way (by signature), leaving the export table alone.
    ///
    /// # Safety
    /// Every entry of `importers` must be a mapped PE image.
    pub unsafe fn hook_imports(
        &self,
        module: &str,
        function: &str,
        original: usize,
        detour: usize,
        importers: &[usize],
    ) -> Result<usize> {
        let key = hook_key(module, function);
        let mut hooks = self.hooks.lock();
        if let Some(existing) = hooks.get(&key) {
            return Ok(existing.original);
        }

        let iat_slots = self.patch_imports(importers, module, function, original, detour);
        if iat_slots.is_empty() {
            return Err(Error::HookInstall(format!(
                "No bound imports of {}!{} to redirect",
                module, function
            )));
        }

        info!(
            target: "framelink_core::export_hooks",
            module,
            function,
            original = format_args!("{:#x}", original),
            imports = iat_slots.len(),
            "Imports redirected"
        );

        hooks.insert(
            key,
            ExportHook {
                module: module.to_string(),
                function: function.to_string(),
                original,
                detour,
                eat: None,
                relay: None,
                iat_slots,
            },
        );
        Ok(original)
    }

    unsafe fn patch_imports(
        &self,
        importers: &[usize],
        module: &str,
        function: &str,
        original: usize,
        detour: usize,
    ) -> Vec<usize> {
        let mut patched = Vec::new();
        for &importer in importers {
            let cells = match pe::import_slots(importer, module, function) {
                Ok(cells) => cells,
                Err(e) => {
                    debug!(
                        target: "framelink_core::export_hooks",
                        importer = format_args!("{:#x}", importer),
                        error = %e,
                        "Skipping unreadable importer"
                    );
                    continue;
                }
            };
            for cell in cells {
                // Only cells bound to the real export; leave other hooks alone
                if std::ptr::read_volatile(cell as *const usize) != original {
                    continue;
                }
                match patch::swap_pointer(self.protection.as_ref(), cell, detour) {
                    Ok(_) => patched.push(cell),
                    Err(e) => warn!(
                        target: "framelink_core::export_hooks",
                        cell = format_args!("{:#x}", cell),
                        error = %e,
                        "Import cell not patched"
                    ),
                }
            }
        }
        patched
    }

    fn restore(&self, hook: ExportHook) -> Result<()> {
        let mut result = Ok(());
        if let Some((entry, rva)) = hook.eat {
            // SAFETY: the cell was located in a mapped export table at hook time.
            if let Err(e) = unsafe { patch::swap_u32(self.protection.as_ref(), entry, rva) } {
                result = Err(e);
            }
        }
        for cell in &hook.iat_slots {
            // SAFETY: as above, for import cells.
            if let Err(e) = unsafe { patch::swap_pointer(self.protection.as_ref(), *cell, hook.original) } {
                warn!(
                    target: "framelink_core::export_hooks",
                    cell = format_args!("{:#x}", cell),
                    error = %e,
                    "Import cell not restored"
                );
            }
        }
        if result.is_ok() {
            if let Some(relay) = hook.relay {
                patch::free_relay(relay);
            }
        }
        info!(
            target: "framelink_core::export_hooks",
            module = %hook.module,
            function = %hook.function,
            "Export restored"
        );
        result
    }

    pub fn unhook(&self, module: &str, function: &str) -> Result<()> {
        let hook = self
            .hooks
            .lock()
            .remove(&hook_key(module, function))
            .ok_or_else(|| Error::Internal(format!("{}!{} is not hooked", module, function)))?;
        self.restore(hook)
    }

    /// Restore every hook, returning how many were cleanly restored
    pub fn unhook_all(&self) -> usize {
        let hooks: Vec<ExportHook> = self.hooks.lock().drain().map(|(_, h)| h).collect();
        hooks
            .into_iter()
            .map(|h| self.restore(h))
            .filter(Result::is_ok)
            .count()
    }

    pub fn original(&self, module: &str, function: &str) -> Option<usize> {
        self.hooks
            .lock()
            .get(&hook_key(module, function))
            .map(|h| h.original)
    }

    pub fn is_hooked(&self, module: &str, function: &str) -> bool {
        self.hooks.lock().contains_key(&hook_key(module, function))
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().len()
    }
}

/// Base addresses of every loaded module, empty when they cannot be listed
pub fn loaded_module_bases() -> Vec<usize> {
    match memory::loaded_modules() {
        Ok(modules) => modules.into_iter().map(|m| m.base).collect(),
        Err(e) => {
            debug!(
                target: "framelink_core::export_hooks",
                error = %e,
                "Module list unavailable, import cells left unpatched"
            );
            Vec::new()
        }
    }
}
