//! Function-table (vtable) slot hooks
//!
//! A COM-style object's first word points at its function table. Patching a
//! slot redirects every call made through that table, for every object that
//! shares it. Records are keyed by `(table, index)` so a slot is hooked at
//! most once and always restored to the exact value found at install time.

use crate::patch::{self, PageProtection};
use framelink_common::{Error, HookRecord, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const WORD: usize = std::mem::size_of::<usize>();

pub struct VTableHookEngine {
    protection: Arc<dyn PageProtection>,
    records: Mutex<HashMap<(usize, usize), HookRecord>>,
}

impl Default for VTableHookEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl VTableHookEngine {
    pub fn new() -> Self {
        Self::with_protection(patch::system_protection())
    }

    pub fn with_protection(protection: Arc<dyn PageProtection>) -> Self {
        Self {
            protection,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Function table of `object`, or `None` for a null object.
    ///
    /// # Safety
    /// A non-null `object` must point to a live COM-style object.
    pub unsafe fn get_table(object: *const std::ffi::c_void) -> Option<usize> {
        if object.is_null() {
            return None;
        }
        let table = *(object as *const usize);
        (table != 0).then_some(table)
    }

    /// Current value of a slot
    ///
    /// # Safety
    /// `table` must be a live function table with more than `index` entries.
    pub unsafe fn read_entry(table: usize, index: usize) -> usize {
        *((table + index * WORD) as *const usize)
    }

    /// Overwrite one slot and return what it held.
    ///
    /// This is the raw primitive with no bookkeeping. A refused protection
    /// change leaves the slot untouched and returns the error.
    ///
    /// # Safety
    /// `table` must be a live function table with more than `index` entries,
    /// and `new_function` must match the slot's calling convention.
    pub unsafe fn install_entry(&self, table: usize, index: usize, new_function: usize) -> Result<usize> {
        if table == 0 {
            return Err(Error::InvalidAddress(table));
        }
        patch::swap_pointer(self.protection.as_ref(), table + index * WORD, new_function)
    }

    /// Hook a slot, recording the original. Hooking a slot that is already
    /// hooked returns the existing record unchanged.
    ///
    /// # Safety
    /// Same as [`VTableHookEngine::install_entry`].
    pub unsafe fn install(&self, table: usize, index: usize, new_function: usize) -> Result<HookRecord> {
        let mut records = self.records.lock();

        if let Some(existing) = records.get(&(table, index)) {
            debug!(
                target: "framelink_core::vtable",
                table = format_args!("{:#x}", table),
                index,
                "Slot already hooked, keeping saved original"
            );
            return Ok(*existing);
        }

        let original = self.install_entry(table, index, new_function).map_err(|e| {
            warn!(
                target: "framelink_core::vtable",
                table = format_args!("{:#x}", table),
                index,
                error = %e,
                "Slot hook not installed"
            );
            e
        })?;

        let record = HookRecord {
            table,
            index,
            original,
            replacement: new_function,
            installed: true,
        };
        records.insert((table, index), record);

        info!(
            target: "framelink_core::vtable",
            table = format_args!("{:#x}", table),
            index,
            original = format_args!("{:#x}", original),
            replacement = format_args!("{:#x}", new_function),
            "Slot hooked"
        );

        Ok(record)
    }

    /// Hook slot `index` of `object`'s table
    ///
    /// # Safety
    /// `object` must be live; see [`VTableHookEngine::install_entry`].
    pub unsafe fn install_on_object(
        &self,
        object: *const std::ffi::c_void,
        index: usize,
        new_function: usize,
    ) -> Result<HookRecord> {
        let table = Self::get_table(object).ok_or(Error::InvalidAddress(object as usize))?;
        self.install(table, index, new_function)
    }

    /// Write the saved original back and forget the record.
    ///
    /// # Safety
    /// The table must still be mapped, and no thread may be inside the
    /// replacement once callers stop holding the original.
    pub unsafe fn remove(&self, table: usize, index: usize) -> Result<()> {
        let mut records = self.records.lock();
        let Some(record) = records.get(&(table, index)).copied() else {
            return Err(Error::Internal(format!(
                "No hook recorded for table {:#x} slot {}",
                table, index
            )));
        };

        self.install_entry(table, index, record.original)?;
        records.remove(&(table, index));

        info!(
            target: "framelink_core::vtable",
            table = format_args!("{:#x}", table),
            index,
            "Slot restored"
        );
        Ok(())
    }

    /// Restore every recorded slot, returning how many were restored
    ///
    /// # Safety
    /// See [`VTableHookEngine::remove`].
    pub unsafe fn remove_all(&self) -> usize {
        let keys: Vec<(usize, usize)> = self.records.lock().keys().copied().collect();
        keys.into_iter()
            .filter(|&(table, index)| self.remove(table, index).is_ok())
            .count()
    }

    pub fn record(&self, table: usize, index: usize) -> Option<HookRecord> {
        self.records.lock().get(&(table, index)).copied()
    }

    pub fn is_hooked(&self, table: usize, index: usize) -> bool {
        self.records.lock().contains_key(&(table, index))
    }

    pub fn hook_count(&self) -> usize {
        self.records.lock().len()
    }
}
