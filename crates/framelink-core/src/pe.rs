//! PE image parsing for mapped modules
//!
//! Reads the export and import directories straight from an image mapped at
//! `base`, so lookups work whether or not the loader has bound a symbol.
//! Both PE32 and PE32+ layouts are understood.

use framelink_common::{Error, Result};
use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr;
use tracing::trace;

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

const LFANEW_OFFSET: usize = 0x3C;
const OPTIONAL_HEADER_OFFSET: usize = 24;

const EXPORT_DIRECTORY: usize = 0;
const IMPORT_DIRECTORY: usize = 1;

/// One named export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub ordinal: u16,
    /// Absolute address, 0 for forwarded exports
    pub address: usize,
    /// `"DLL.Function"` when the export forwards elsewhere
    pub forwarder: Option<String>,
}

/// Location of one export-address-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSlot {
    /// Address of the 32-bit RVA cell in the export address table
    pub entry: usize,
    /// RVA currently stored in that cell
    pub rva: u32,
}

#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy)]
struct ImageLayout {
    pe32_plus: bool,
    exports: DataDirectory,
    imports: DataDirectory,
}

unsafe fn read_u16(addr: usize) -> u16 {
    ptr::read_unaligned(addr as *const u16)
}

unsafe fn read_u32(addr: usize) -> u32 {
    ptr::read_unaligned(addr as *const u32)
}

unsafe fn read_u64(addr: usize) -> u64 {
    ptr::read_unaligned(addr as *const u64)
}

unsafe fn read_c_string(addr: usize) -> String {
    CStr::from_ptr(addr as *const std::ffi::c_char)
        .to_string_lossy()
        .into_owned()
}

unsafe fn image_layout(base: usize) -> Result<ImageLayout> {
    if base == 0 {
        return Err(Error::InvalidAddress(base));
    }
    if read_u16(base) != DOS_MAGIC {
        return Err(Error::Internal(format!(
            "No DOS header at {:#x}",
            base
        )));
    }

    let nt = base + read_u32(base + LFANEW_OFFSET) as usize;
    if read_u32(nt) != NT_SIGNATURE {
        return Err(Error::Internal(format!("No NT header at {:#x}", nt)));
    }

    let optional = nt + OPTIONAL_HEADER_OFFSET;
    let (pe32_plus, dirs, count) = match read_u16(optional) {
        PE32_PLUS_MAGIC => (true, optional + 112, read_u32(optional + 108)),
        PE32_MAGIC => (false, optional + 96, read_u32(optional + 92)),
        other => {
            return Err(Error::Internal(format!(
                "Unknown optional header magic {:#x}",
                other
            )))
        }
    };

    let directory = |index: usize| -> DataDirectory {
        if (index as u32) < count {
            DataDirectory {
                rva: read_u32(dirs + index * 8),
                size: read_u32(dirs + index * 8 + 4),
            }
        } else {
            DataDirectory { rva: 0, size: 0 }
        }
    };

    Ok(ImageLayout {
        pe32_plus,
        exports: directory(EXPORT_DIRECTORY),
        imports: directory(IMPORT_DIRECTORY),
    })
}

/// Parse every named export of the image at `base`.
///
/// # Safety
/// `base` must point to a complete PE image mapped in loader layout.
pub unsafe fn parse_exports(base: usize) -> Result<Vec<ExportEntry>> {
    let layout = image_layout(base)?;
    let mut exports = Vec::new();

    let dir_rva = layout.exports.rva;
    if dir_rva == 0 {
        return Ok(exports);
    }
    let dir = base + dir_rva as usize;
    let dir_end = dir_rva.saturating_add(layout.exports.size);

    let ordinal_base = read_u32(dir + 16);
    let num_functions = read_u32(dir + 20) as usize;
    let num_names = read_u32(dir + 24) as usize;
    let functions = base + read_u32(dir + 28) as usize;
    let names = base + read_u32(dir + 32) as usize;
    let ordinals = base + read_u32(dir + 36) as usize;

    for i in 0..num_names {
        let name_rva = read_u32(names + i * 4);
        let index = read_u16(ordinals + i * 2) as usize;
        if index >= num_functions {
            continue;
        }

        let func_rva = read_u32(functions + index * 4);
        let name = read_c_string(base + name_rva as usize);

        // An RVA inside the export directory names a forwarder string
        let (address, forwarder) = if func_rva >= dir_rva && func_rva < dir_end {
            (0, Some(read_c_string(base + func_rva as usize)))
        } else {
            (base + func_rva as usize, None)
        };

        exports.push(ExportEntry {
            name,
            ordinal: (ordinal_base + index as u32) as u16,
            address,
            forwarder,
        });
    }

    Ok(exports)
}

/// Forwarder chains longer than this are treated as unresolvable
const MAX_FORWARD_DEPTH: usize = 8;

/// Name to address map of the image's exports. Forwarded exports are
/// left out; use [`resolve_exports_with`] to follow them.
///
/// # Safety
/// See [`parse_exports`].
pub unsafe fn resolve_exports_at(base: usize) -> Result<HashMap<String, usize>> {
    resolve_exports_with(base, |_| None)
}

/// Name to address map of every named export, forwarders followed to
/// their final address. `locate` maps a forwarder's module name (without
/// extension, e.g. `"DXGIDEBUG"`) to the base of that loaded image.
/// Forwarders whose target cannot be located are left out.
///
/// # Safety
/// See [`parse_exports`]; every base `locate` returns must satisfy it too.
pub unsafe fn resolve_exports_with(
    base: usize,
    locate: impl Fn(&str) -> Option<usize>,
) -> Result<HashMap<String, usize>> {
    let mut resolved = HashMap::new();
    for entry in parse_exports(base)? {
        let address = match &entry.forwarder {
            None => Some(entry.address),
            Some(target) => follow_forwarder(target, &locate, MAX_FORWARD_DEPTH),
        };
        match address {
            Some(address) => {
                resolved.insert(entry.name, address);
            }
            None => trace!(
                target: "framelink_core::pe",
                name = %entry.name,
                forwarder = ?entry.forwarder,
                "Forwarded export not resolved"
            ),
        }
    }
    Ok(resolved)
}

/// Resolve `"MODULE.Function"` or `"MODULE.#ordinal"`
unsafe fn follow_forwarder(
    target: &str,
    locate: &impl Fn(&str) -> Option<usize>,
    depth: usize,
) -> Option<usize> {
    if depth == 0 {
        return None;
    }
    let (module, symbol) = target.rsplit_once('.')?;
    let base = locate(module)?;
    let exports = parse_exports(base).ok()?;

    let entry = match symbol.strip_prefix('#') {
        Some(ordinal) => {
            let ordinal: u16 = ordinal.parse().ok()?;
            exports.into_iter().find(|e| e.ordinal == ordinal)?
        }
        None => exports.into_iter().find(|e| e.name == symbol)?,
    };
    match entry.forwarder {
        None => Some(entry.address),
        Some(next) => follow_forwarder(&next, locate, depth - 1),
    }
}

/// Find the export-address-table cell backing `name`
///
/// # Safety
/// See [`parse_exports`].
pub unsafe fn export_slot(base: usize, name: &str) -> Result<ExportSlot> {
    let layout = image_layout(base)?;
    let dir_rva = layout.exports.rva;
    if dir_rva == 0 {
        return Err(Error::ExportNotFound(name.to_string()));
    }
    let dir = base + dir_rva as usize;

    let num_functions = read_u32(dir + 20) as usize;
    let num_names = read_u32(dir + 24) as usize;
    let functions = base + read_u32(dir + 28) as usize;
    let names = base + read_u32(dir + 32) as usize;
    let ordinals = base + read_u32(dir + 36) as usize;

    for i in 0..num_names {
        let name_rva = read_u32(names + i * 4);
        if read_c_string(base + name_rva as usize) != name {
            continue;
        }
        let index = read_u16(ordinals + i * 2) as usize;
        if index >= num_functions {
            break;
        }
        let entry = functions + index * 4;
        return Ok(ExportSlot {
            entry,
            rva: read_u32(entry),
        });
    }

    Err(Error::ExportNotFound(name.to_string()))
}

/// Import-address-table cells in the image that import `function` by name
/// from `dll` (case-insensitive).
///
/// # Safety
/// See [`parse_exports`].
pub unsafe fn import_slots(base: usize, dll: &str, function: &str) -> Result<Vec<usize>> {
    let layout = image_layout(base)?;
    let mut slots = Vec::new();

    if layout.imports.rva == 0 {
        return Ok(slots);
    }

    let thunk_size = if layout.pe32_plus { 8 } else { 4 };
    let ordinal_flag: u64 = if layout.pe32_plus {
        0x8000_0000_0000_0000
    } else {
        0x8000_0000
    };
    let read_thunk = |addr: usize| -> u64 {
        if layout.pe32_plus {
            read_u64(addr)
        } else {
            read_u32(addr) as u64
        }
    };

    let mut desc = base + layout.imports.rva as usize;
    loop {
        let name_rva = read_u32(desc + 12);
        if name_rva == 0 {
            break;
        }

        let dll_name = read_c_string(base + name_rva as usize);
        if dll_name.eq_ignore_ascii_case(dll) {
            let original_first = read_u32(desc);
            let first = read_u32(desc + 16);
            let lookup_rva = if original_first != 0 { original_first } else { first };

            let mut lookup = base + lookup_rva as usize;
            let mut iat = base + first as usize;
            loop {
                let thunk = read_thunk(lookup);
                if thunk == 0 {
                    break;
                }
                if thunk & ordinal_flag == 0 {
                    // IMAGE_IMPORT_BY_NAME: u16 hint, then the name
                    let import_name = read_c_string(base + thunk as usize + 2);
                    if import_name == function {
                        slots.push(iat);
                    }
                }
                lookup += thunk_size;
                iat += thunk_size;
            }
        }

        desc += 20;
    }

    Ok(slots)
}


#[cfg(test)]
mod tests {
    use super::test_image::{build, iat_offset};
    use super::*;

    #[test]
    fn test_parse_exports() {
        let image = build(
            &[("CreateDXGIFactory", 0x2000), ("CreateDXGIFactory1", 0x2100)],
            &[],
            &[],
        );
        let exports = unsafe { parse_exports(image.base()).unwrap() };
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].name, "CreateDXGIFactory");
        assert_eq!(exports[0].address, image.base() + 0x2000);
        assert_eq!(exports[0].ordinal, 1);
        assert_eq!(exports[1].address, image.base() + 0x2100);
    }

    #[test]
    fn test_resolve_exports_skips_forwarders() {
        let image = build(
            &[("D3D11CreateDevice", 0x3000)],
            &[("GetDebugInterface", "DXGIDEBUG.GetDebugInterface")],
            &[],
        );
        let all = unsafe { parse_exports(image.base()).unwrap() };
        let forwarded = all.iter().find(|e| e.name == "GetDebugInterface").unwrap();
        assert_eq!(forwarded.address, 0);
        assert_eq!(
            forwarded.forwarder.as_deref(),
            Some("DXGIDEBUG.GetDebugInterface")
        );

        let map = unsafe { resolve_exports_at(image.base()).unwrap() };
        assert_eq!(map.len(), 1);
        assert_eq!(map["D3D11CreateDevice"], image.base() + 0x3000);
    }

    #[test]
    fn test_forwarded_exports_followed() {
        let debug = build(&[("GetDebugInterface", 0x4000)], &[], &[]);
        let middle = build(&[], &[("DXGIGetDebugInterface1", "DXGIDEBUG.#1")], &[]);
        let image = build(
            &[("D3D11CreateDevice", 0x3000)],
            &[
                ("GetDebugInterface", "DXGIDEBUG.GetDebugInterface"),
                ("GetDebugInterface1", "MIDDLE.DXGIGetDebugInterface1"),
                ("Missing", "NOTLOADED.Anything"),
            ],
            &[],
        );
        let locate = |module: &str| match module {
            "DXGIDEBUG" => Some(debug.base()),
            "MIDDLE" => Some(middle.base()),
            _ => None,
        };

        let map = unsafe { resolve_exports_with(image.base(), locate).unwrap() };
        assert_eq!(map.len(), 3);
        assert_eq!(map["D3D11CreateDevice"], image.base() + 0x3000);
        assert_eq!(map["GetDebugInterface"], debug.base() + 0x4000);
        assert_eq!(map["GetDebugInterface1"], debug.base() + 0x4000);
        assert!(!map.contains_key("Missing"));
    }

    #[test]
    fn test_forwarder_cycle_gives_up() {
        let image = build(&[], &[("Loop", "SELF.Loop")], &[]);
        let base = image.base();
        let map = unsafe { resolve_exports_with(base, |_| Some(base)).unwrap() };
        assert!(map.is_empty());
    }

    #[test]
    fn test_export_slot() {
        let image = build(&[("Alpha", 0x2000), ("Beta", 0x2040)], &[], &[]);
        let slot = unsafe { export_slot(image.base(), "Beta").unwrap() };
        assert_eq!(slot.rva, 0x2040);
        let stored = unsafe { read_u32(slot.entry) };
        assert_eq!(stored, 0x2040);
    }

    #[test]
    fn test_export_slot_missing() {
        let image = build(&[("Alpha", 0x2000)], &[], &[]);
        let err = unsafe { export_slot(image.base(), "Gamma").unwrap_err() };
        assert!(matches!(err, Error::ExportNotFound(name) if name == "Gamma"));
    }

    #[test]
    fn test_import_slots() {
        let image = build(
            &[],
            &[],
            &[
                ("KERNEL32.dll", &["Sleep"], 0x1111),
                ("d3d11.dll", &["D3D11CreateDevice", "D3D11CreateDeviceAndSwapChain"], 0x2222),
            ],
        );
        let slots =
            unsafe { import_slots(image.base(), "D3D11.DLL", "D3D11CreateDeviceAndSwapChain").unwrap() };
        assert_eq!(slots, vec![image.base() + iat_offset(&image, 1) + 8]);

        let none = unsafe { import_slots(image.base(), "dxgi.dll", "CreateDXGIFactory").unwrap() };
        assert!(none.is_empty());
    }

    #[test]
    fn test_not_a_pe() {
        let junk = vec![0u8; 256];
        assert!(unsafe { parse_exports(junk.as_ptr() as usize) }.is_err());
        assert!(matches!(
            unsafe { parse_exports(0) },
            Err(Error::InvalidAddress(0))
        ));
    }
}
