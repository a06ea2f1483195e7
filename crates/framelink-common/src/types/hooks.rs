//! Hook bookkeeping types

use serde::{Deserialize, Serialize};

/// One patched function-table slot.
///
/// `original` is the exact pointer value found in the slot at install time
/// and is what removal writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRecord {
    pub table: usize,
    pub index: usize,
    pub original: usize,
    pub replacement: usize,
    pub installed: bool,
}

impl HookRecord {
    /// Address of the patched slot
    pub fn slot_address(&self) -> usize {
        self.table + self.index * std::mem::size_of::<usize>()
    }
}

/// Lifecycle of a hook component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HookState {
    #[default]
    Uninstalled,
    Installed,
}
