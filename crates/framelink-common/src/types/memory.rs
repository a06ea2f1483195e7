//! Memory-related types

use serde::{Deserialize, Serialize};

const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_WRITECOPY: u32 = 0x08;
const PAGE_EXECUTE: u32 = 0x10;
const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;
const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
const PAGE_GUARD: u32 = 0x100;

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Touching the page raises a one-shot guard exception
    pub guard: bool,
}

impl Protection {
    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
            guard: false,
        }
    }

    /// Decode a raw `PAGE_*` value. Modifier bits other than guard are ignored.
    pub fn from_windows(protect: u32) -> Self {
        let base = protect & 0xFF;

        let execute = matches!(
            base,
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        );
        let read = matches!(
            base,
            PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY
        );
        let write = matches!(
            base,
            PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        );

        Self {
            read,
            write,
            execute,
            guard: protect & PAGE_GUARD != 0,
        }
    }

    /// True for pages with no access bits at all
    pub fn is_no_access(protect: u32) -> bool {
        protect & 0xFF == PAGE_NOACCESS || protect == 0
    }

    /// Whether a scan may touch the page.
    ///
    /// Execute-only pages count when scanning for code: in-process reads of
    /// them succeed on every supported target.
    pub fn is_scannable(&self, include_execute_only: bool) -> bool {
        if self.guard {
            return false;
        }
        self.read || (include_execute_only && self.execute)
    }
}

/// Memory region information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
    pub protection: Protection,
    pub state: MemoryState,
    pub region_type: MemoryType,
}

impl MemoryRegion {
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryState {
    Commit,
    Reserve,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryType {
    Image,
    Mapped,
    Private,
}
