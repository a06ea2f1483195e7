//! Address-space and module queries for the current process

use framelink_common::{Error, MemoryRegion, MemoryState, MemoryType, Protection, Result};

#[cfg(target_os = "windows")]
use windows::{
    core::PCWSTR,
    Win32::Foundation::HMODULE,
    Win32::System::LibraryLoader::GetModuleHandleW,
    Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION},
    Win32::System::ProcessStatus::{
        EnumProcessModules, GetModuleBaseNameW, GetModuleInformation, MODULEINFO,
    },
    Win32::System::Threading::GetCurrentProcess,
};

/// A module mapped into the current process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

pub fn region_from_mbi(
    base: usize,
    size: usize,
    protect: u32,
    state: u32,
    mem_type: u32,
) -> MemoryRegion {
    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_IMAGE: u32 = 0x1000000;
    const MEM_MAPPED: u32 = 0x40000;

    let state = if state == MEM_COMMIT {
        MemoryState::Commit
    } else if state == MEM_RESERVE {
        MemoryState::Reserve
    } else {
        MemoryState::Free
    };

    let region_type = if mem_type & MEM_IMAGE != 0 {
        MemoryType::Image
    } else if mem_type & MEM_MAPPED != 0 {
        MemoryType::Mapped
    } else {
        MemoryType::Private
    };

    MemoryRegion {
        base,
        size,
        protection: Protection::from_windows(protect),
        state,
        region_type,
    }
}

/// Walk the whole address space once and return committed, accessible regions
/// in ascending address order.
#[cfg(target_os = "windows")]
pub fn enumerate_regions() -> Result<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    let mut addr: usize = 0;

    unsafe {
        loop {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            let result = VirtualQuery(
                Some(addr as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );

            if result == 0 {
                break;
            }

            let region = region_from_mbi(
                mbi.BaseAddress as usize,
                mbi.RegionSize,
                mbi.Protect.0,
                mbi.State.0,
                mbi.Type.0,
            );

            if region.state == MemoryState::Commit && !Protection::is_no_access(mbi.Protect.0) {
                regions.push(region);
            }

            addr = mbi.BaseAddress as usize + mbi.RegionSize;
            if addr == 0 {
                break;
            }
        }
    }

    tracing::debug!(target: "framelink_core::memory", count = regions.len(), "Enumerated committed regions");
    Ok(regions)
}

#[cfg(not(target_os = "windows"))]
pub fn enumerate_regions() -> Result<Vec<MemoryRegion>> {
    Err(Error::NotImplemented(
        "Region enumeration only supported on Windows".into(),
    ))
}

/// Base address and image size of a loaded module
#[cfg(target_os = "windows")]
pub fn module_range(name: &str) -> Result<(usize, usize)> {
    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        let handle = GetModuleHandleW(PCWSTR(wide.as_ptr()))
            .map_err(|_| Error::ModuleNotFound(name.to_string()))?;
        let mut info = MODULEINFO::default();
        GetModuleInformation(
            GetCurrentProcess(),
            handle,
            &mut info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )
        .map_err(|e| Error::ModuleNotFound(format!("{}: {}", name, e)))?;
        Ok((info.lpBaseOfDll as usize, info.SizeOfImage as usize))
    }
}

#[cfg(not(target_os = "windows"))]
pub fn module_range(name: &str) -> Result<(usize, usize)> {
    Err(Error::ModuleNotFound(format!(
        "{} (module lookup only supported on Windows)",
        name
    )))
}

/// Every module currently mapped into the process
#[cfg(target_os = "windows")]
pub fn loaded_modules() -> Result<Vec<LoadedModule>> {
    let mut modules = Vec::new();

    unsafe {
        let process = GetCurrentProcess();
        let mut handles: [HMODULE; 1024] = [HMODULE::default(); 1024];
        let mut needed: u32 = 0;

        EnumProcessModules(
            process,
            handles.as_mut_ptr(),
            std::mem::size_of_val(&handles) as u32,
            &mut needed,
        )
        .map_err(|e| Error::Internal(format!("EnumProcessModules failed: {}", e)))?;

        let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(handles.len());
        for hmod in handles.iter().take(count).copied() {
            let mut name_buf = [0u16; 260];
            let len = GetModuleBaseNameW(process, hmod, &mut name_buf);
            if len == 0 {
                continue;
            }

            let mut info = MODULEINFO::default();
            if GetModuleInformation(
                process,
                hmod,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
            .is_ok()
            {
                modules.push(LoadedModule {
                    name: String::from_utf16_lossy(&name_buf[..len as usize]),
                    base: info.lpBaseOfDll as usize,
                    size: info.SizeOfImage as usize,
                });
            }
        }
    }

    Ok(modules)
}

#[cfg(not(target_os = "windows"))]
pub fn loaded_modules() -> Result<Vec<LoadedModule>> {
    Err(Error::NotImplemented(
        "Module enumeration only supported on Windows".into(),
    ))
}

/// Keep only the parts of `regions` that overlap `[start, end)`, clipped to it
pub fn clip_regions(regions: &[MemoryRegion], start: usize, end: usize) -> Vec<MemoryRegion> {
    regions
        .iter()
        .filter(|r| r.base < end && r.end() > start)
        .map(|r| {
            let base = r.base.max(start);
            let stop = r.end().min(end);
            MemoryRegion {
                base,
                size: stop - base,
                ..r.clone()
            }
        })
        .collect()
}
