//! Named shared-memory segment plus its frame-available signal
//!
//! On Windows this is a pagefile-backed file mapping and an auto-reset
//! event named `{name}Event`. Elsewhere the segment is a file in the temp
//! directory mapped with `memmap2`, and waiting polls instead of blocking
//! on an event; the creating endpoint deletes the file when it goes away.

use framelink_common::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long an opener waits for the creator to size the segment
const ATTACH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Segment {
    ptr: *mut u8,
    len: usize,
    created: bool,
    name: String,
    platform: platform::Backing,
}

// The mapping is process-wide; all access goes through atomics or the
// segment's own lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create the segment, or attach when it already exists. The caller
    /// learns which from [`Segment::is_creator`].
    pub fn create_or_open(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        platform::create_or_open(name, size)
    }

    /// Attach to an existing segment without creating one
    pub fn open(name: &str) -> Result<Self> {
        validate_name(name)?;
        platform::open(name)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_creator(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake a waiting reader
    pub fn signal(&self) {
        self.platform.signal();
    }

    /// Block until `available` holds or `timeout` passes
    pub fn wait_until(&self, timeout: Duration, available: impl Fn() -> bool) -> bool {
        if available() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return available();
            }
            self.platform.wait(deadline - now);
            if available() {
                return true;
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("segment name must not be empty".into()));
    }
    if name.contains(['/', '\\']) && !name.starts_with("Local\\") && !name.starts_with("Global\\") {
        return Err(Error::Config(format!(
            "segment name {:?} must not contain path separators",
            name
        )));
    }
    Ok(())
}

/// Name of the event paired with a segment
pub fn event_name(segment: &str) -> String {
    format!("{}Event", segment)
}

#[cfg(target_os = "windows")]
mod platform {
    use super::{event_name, Segment, ATTACH_TIMEOUT};
    use framelink_common::{Error, Result};
    use std::ffi::c_void;
    use std::time::{Duration, Instant};
    use windows::core::HSTRING;
    use windows::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
        FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
        PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};

    pub struct Backing {
        mapping: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        event: HANDLE,
    }

    impl Backing {
        pub fn signal(&self) {
            unsafe {
                let _ = SetEvent(self.event);
            }
        }

        pub fn wait(&self, timeout: Duration) {
            let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
            unsafe {
                let _ = WaitForSingleObject(self.event, millis);
            }
        }
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.mapping);
                let _ = CloseHandle(self.event);
            }
        }
    }

    fn open_event(name: &str) -> Result<HANDLE> {
        // Opens the existing event when a peer created it first
        unsafe { CreateEventW(None, false, false, &HSTRING::from(event_name(name))) }
            .map_err(|e| Error::Transport(format!("CreateEventW failed: {}", e)))
    }

    fn mapped_len(view: MEMORY_MAPPED_VIEW_ADDRESS) -> usize {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(view.Value as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            0
        } else {
            info.RegionSize
        }
    }

    fn map(mapping: HANDLE, name: &str, size: usize, created: bool) -> Result<Segment> {
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let error = std::io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(mapping);
            }
            return Err(Error::Transport(format!("MapViewOfFile failed: {}", error)));
        }

        let event = match open_event(name) {
            Ok(event) => event,
            Err(e) => {
                unsafe {
                    let _ = UnmapViewOfFile(view);
                    let _ = CloseHandle(mapping);
                }
                return Err(e);
            }
        };

        let len = if size == 0 { mapped_len(view) } else { size };
        Ok(Segment {
            ptr: view.Value as *mut u8,
            len,
            created,
            name: name.to_string(),
            platform: Backing {
                mapping,
                view,
                event,
            },
        })
    }

    pub fn create_or_open(name: &str, size: usize) -> Result<Segment> {
        let size64 = size as u64;
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size64 >> 32) as u32,
                size64 as u32,
                &HSTRING::from(name),
            )
        }
        .map_err(|e| Error::Transport(format!("CreateFileMappingW failed: {}", e)))?;

        let existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        // An existing mapping keeps its own size; map all of it
        map(mapping, name, if existed { 0 } else { size }, !existed)
    }

    pub fn open(name: &str) -> Result<Segment> {
        let deadline = Instant::now() + ATTACH_TIMEOUT;
        loop {
            match unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &HSTRING::from(name)) } {
                Ok(mapping) => return map(mapping, name, 0, false),
                Err(e) if Instant::now() >= deadline => {
                    return Err(Error::Transport(format!(
                        "Segment {} not found: {}",
                        name, e
                    )))
                }
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    use super::{Segment, ATTACH_TIMEOUT};
    use framelink_common::{Error, Result};
    use memmap2::MmapMut;
    use std::fs::{File, OpenOptions};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub struct Backing {
        _map: MmapMut,
        path: PathBuf,
        owner: bool,
    }

    impl Backing {
        pub fn signal(&self) {}

        pub fn wait(&self, timeout: Duration) {
            std::thread::sleep(timeout.min(POLL_INTERVAL));
        }
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            if self.owner {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    /// File standing in for the named segment
    pub fn segment_path(name: &str) -> PathBuf {
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!("framelink-{}.shm", sanitized))
    }

    fn map(file: &File, path: PathBuf, name: &str, created: bool) -> Result<Segment> {
        // SAFETY: the file is only resized by its creator before peers map it.
        let mut map = unsafe { MmapMut::map_mut(file)? };
        let ptr = map.as_mut_ptr();
        let len = map.len();
        Ok(Segment {
            ptr,
            len,
            created,
            name: name.to_string(),
            platform: Backing {
                _map: map,
                path,
                owner: created,
            },
        })
    }

    fn open_sized(path: PathBuf, name: &str) -> Result<Segment> {
        let deadline = Instant::now() + ATTACH_TIMEOUT;
        loop {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) if file.metadata()?.len() > 0 => return map(&file, path, name, false),
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Ok(_) => {
                    return Err(Error::Transport(format!("Segment {} was never sized", name)))
                }
                Err(e) => {
                    return Err(Error::Transport(format!("Segment {} not found: {}", name, e)))
                }
            }
        }
    }

    pub fn create_or_open(name: &str, size: usize) -> Result<Segment> {
        let path = segment_path(name);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                if let Err(e) = file.set_len(size as u64) {
                    let _ = std::fs::remove_file(&path);
                    return Err(e.into());
                }
                map(&file, path, name, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => open_sized(path, name),
            Err(e) => Err(e.into()),
        }
    }

    pub fn open(name: &str) -> Result<Segment> {
        open_sized(segment_path(name), name)
    }
}

#[cfg(not(target_os = "windows"))]
pub use platform::segment_path;

impl Drop for Segment {
    fn drop(&mut self) {
        debug!(
            target: "framelink_core::ring",
            name = %self.name,
            creator = self.created,
            "Segment detached"
        );
    }
}
