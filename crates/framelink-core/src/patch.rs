//! Page-protection aware writes into normally read-only memory
//!
//! Every patch follows the same shape: relax the page, write, put the old
//! protection back. The protection backend is a trait so the hook engine
//! can run against plain heap memory.

use framelink_common::{Error, Result};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(target_os = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache,
    Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    },
    Threading::GetCurrentProcess,
};

/// Changes page protection around a patch
pub trait PageProtection: Send + Sync {
    /// Make `[address, address + size)` writable, returning the previous
    /// protection value.
    fn unprotect(&self, address: usize, size: usize) -> Result<u32>;

    /// Put back a protection value returned by [`PageProtection::unprotect`].
    fn restore(&self, address: usize, size: usize, previous: u32) -> Result<()>;
}

/// The operating system's own protection calls
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProtection;

#[cfg(target_os = "windows")]
impl PageProtection for SystemProtection {
    fn unprotect(&self, address: usize, size: usize) -> Result<u32> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                size,
                PAGE_READWRITE,
                &mut old,
            )
        }
        .map_err(|e| Error::Protection {
            address,
            message: format!("VirtualProtect failed: {}", e),
        })?;
        Ok(old.0)
    }

    fn restore(&self, address: usize, size: usize, previous: u32) -> Result<()> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtect(
                address as *const std::ffi::c_void,
                size,
                PAGE_PROTECTION_FLAGS(previous),
                &mut old,
            )
        }
        .map_err(|e| Error::Protection {
            address,
            message: format!("VirtualProtect restore failed: {}", e),
        })
    }
}

/// Outside Windows the targets are ordinary writable allocations.
#[cfg(not(target_os = "windows"))]
impl PageProtection for SystemProtection {
    fn unprotect(&self, _address: usize, _size: usize) -> Result<u32> {
        Ok(0)
    }

    fn restore(&self, _address: usize, _size: usize, _previous: u32) -> Result<()> {
        Ok(())
    }
}

/// Shared default backend
pub fn system_protection() -> Arc<dyn PageProtection> {
    Arc::new(SystemProtection)
}

fn with_unprotected<T>(
    protection: &dyn PageProtection,
    address: usize,
    size: usize,
    write: impl FnOnce() -> T,
) -> Result<T> {
    if address == 0 {
        return Err(Error::InvalidAddress(address));
    }
    let previous = protection.unprotect(address, size)?;
    let value = write();
    if let Err(e) = protection.restore(address, size, previous) {
        // The write already happened; a page left writable is not fatal.
        tracing::warn!(
            target: "framelink_core::patch",
            address = format_args!("{:#x}", address),
            error = %e,
            "Could not restore page protection"
        );
    }
    Ok(value)
}

/// Atomically replace a pointer-sized cell, returning the previous value.
///
/// # Safety
/// `address` must be a valid, pointer-aligned cell that no one else frees
/// during the call.
pub unsafe fn swap_pointer(
    protection: &dyn PageProtection,
    address: usize,
    value: usize,
) -> Result<usize> {
    if address % std::mem::align_of::<usize>() != 0 {
        return Err(Error::InvalidAddress(address));
    }
    with_unprotected(protection, address, std::mem::size_of::<usize>(), || {
        (*(address as *const AtomicUsize)).swap(value, Ordering::SeqCst)
    })
}

/// Atomically replace a 32-bit cell, returning the previous value.
///
/// # Safety
/// `address` must be a valid, 4-byte aligned cell.
pub unsafe fn swap_u32(protection: &dyn PageProtection, address: usize, value: u32) -> Result<u32> {
    if address % 4 != 0 {
        return Err(Error::InvalidAddress(address));
    }
    with_unprotected(protection, address, 4, || {
        (*(address as *const AtomicU32)).swap(value, Ordering::SeqCst)
    })
}

/// x64 absolute jump: `FF 25 00 00 00 00` followed by the 8-byte target
pub const ABS_JUMP_SIZE: usize = 14;

pub fn abs_jump(target: usize) -> [u8; ABS_JUMP_SIZE] {
    let mut bytes = [0u8; ABS_JUMP_SIZE];
    bytes[0] = 0xFF;
    bytes[1] = 0x25;
    bytes[6..14].copy_from_slice(&(target as u64).to_le_bytes());
    bytes
}

/// An executable stub that jumps to a fixed target.
///
/// Placed above a module base so a 32-bit export RVA can reach it.
#[derive(Debug)]
pub struct RelayStub {
    pub address: usize,
    pub target: usize,
}

impl RelayStub {
    /// Offset of the stub from `module_base`, if it fits an export RVA
    pub fn rva_from(&self, module_base: usize) -> Option<u32> {
        self.address
            .checked_sub(module_base)
            .and_then(|d| u32::try_from(d).ok())
    }
}

/// Allocate a relay stub within 2 GiB above `module_base`
#[cfg(target_os = "windows")]
pub fn allocate_relay(module_base: usize, target: usize) -> Result<RelayStub> {
    const STEP: usize = 0x10000;
    const MAX_DISTANCE: usize = 0x7FFF_0000;
    const RELAY_ALLOC_SIZE: usize = 0x1000;

    let mut distance = STEP;
    while distance < MAX_DISTANCE {
        let Some(hint) = module_base.checked_add(distance) else {
            break;
        };
        let mem = unsafe {
            VirtualAlloc(
                Some(hint as *const std::ffi::c_void),
                RELAY_ALLOC_SIZE,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if !mem.is_null() {
            let address = mem as usize;
            let code = abs_jump(target);
            unsafe {
                std::ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
                let _ = FlushInstructionCache(GetCurrentProcess(), Some(mem as *const _), code.len());
            }
            return Ok(RelayStub { address, target });
        }
        distance += STEP;
    }

    Err(Error::HookInstall(format!(
        "No free page within 2 GiB above {:#x} for a relay stub",
        module_base
    )))
}

#[cfg(not(target_os = "windows"))]
pub fn allocate_relay(_module_base: usize, _target: usize) -> Result<RelayStub> {
    Err(Error::NotImplemented(
        "Relay stubs only supported on Windows".into(),
    ))
}

/// Release a stub from [`allocate_relay`]
#[cfg(target_os = "windows")]
pub fn free_relay(stub: RelayStub) {
    unsafe {
        let _ = VirtualFree(stub.address as *mut std::ffi::c_void, 0, MEM_RELEASE);
    }
}

#[cfg(not(target_os = "windows"))]
pub fn free_relay(_stub: RelayStub) {}


#[cfg(test)]
mod tests {
    use super::testing::RecordingProtection;
    use super::*;

    #[test]
    fn test_abs_jump_encoding() {
        let bytes = abs_jump(0x1122334455667788);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&bytes[6..], &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn test_swap_pointer_restores_protection() {
        let protection = RecordingProtection::default();
        let mut cell: usize = 0xAAAA;
        let addr = &mut cell as *mut usize as usize;

        let old = unsafe { swap_pointer(&protection, addr, 0xBBBB).unwrap() };
        assert_eq!(old, 0xAAAA);
        assert_eq!(cell, 0xBBBB);
        assert_eq!(
            *protection.calls.lock(),
            vec![("unprotect", addr), ("restore", addr)]
        );
    }

    #[test]
    fn test_swap_refused_leaves_memory() {
        let protection = RecordingProtection::default();
        protection.refuse.store(true, Ordering::SeqCst);
        let mut cell: usize = 7;
        let addr = &mut cell as *mut usize as usize;

        let err = unsafe { swap_pointer(&protection, addr, 9) }.unwrap_err();
        assert!(matches!(err, Error::Protection { .. }));
        assert_eq!(cell, 7);
    }

    #[test]
    fn test_swap_rejects_null_and_misaligned() {
        let protection = SystemProtection;
        assert!(matches!(
            unsafe { swap_pointer(&protection, 0, 1) },
            Err(Error::InvalidAddress(0))
        ));
        let cells = [0u64; 2];
        let misaligned = cells.as_ptr() as usize + 1;
        assert!(unsafe { swap_pointer(&protection, misaligned, 1) }.is_err());
    }

    #[test]
    fn test_swap_u32() {
        let protection = SystemProtection;
        let mut cell: u32 = 0x2000;
        let addr = &mut cell as *mut u32 as usize;
        let old = unsafe { swap_u32(&protection, addr, 0x3000).unwrap() };
        assert_eq!(old, 0x2000);
        assert_eq!(cell, 0x3000);
    }

    #[test]
    fn test_relay_rva() {
        let stub = RelayStub {
            address: 0x7FF6_0001_0000,
            target: 0,
        };
        assert_eq!(stub.rva_from(0x7FF6_0000_0000), Some(0x1_0000));
        assert_eq!(stub.rva_from(0x7FF7_0000_0000), None);
    }
}
