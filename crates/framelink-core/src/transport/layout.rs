//! Binary layout of the shared segment
//!
//! ```text
//! +--------------------+ 0
//! | SharedMemoryHeader |
//! +--------------------+ data_offset
//! | slot 0             |  FrameSlotHeader + payload, slot_size bytes
//! | slot 1             |
//! | ...                |
//! +--------------------+ total_size
//! ```
//!
//! All integers are little-endian native layout. `slot_count` in the header
//! is the physical slot count; the ring keeps one slot free, so it retains
//! `slot_count - 1` unread frames.

use framelink_common::{CompressionType, Error, Result};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "FLNK"
pub const MAGIC: u32 = 0x464C_4E4B;
pub const VERSION: u32 = 1;
pub const CACHE_LINE: usize = 64;

/// Space reserved for each slot's header
pub const SLOT_HEADER_SIZE: usize = 64;

/// Slot holds a complete frame
pub const SLOT_FLAG_VALID: u32 = 0x1;

/// Counter alone on its cache line
#[repr(C, align(64))]
pub struct CacheLineU32 {
    pub value: AtomicU32,
}

#[repr(C, align(64))]
pub struct CacheLineU64 {
    pub value: AtomicU64,
}

/// Control block at offset 0 of the segment.
///
/// Everything above `ready` is written once by the creating process before
/// `ready` is published and is read-only afterwards.
#[repr(C)]
pub struct SharedMemoryHeader {
    pub magic: u32,
    pub version: u32,
    pub total_size: u64,
    pub data_offset: u64,
    pub slot_count: u32,
    pub slot_size: u32,
    /// Bit `1 << CompressionType` per codec the creator can produce
    pub capabilities: u32,
    pub ready: AtomicU32,
    /// Reader/writer lock word, see `lock.rs`
    pub lock: CacheLineU32,
    /// Next slot to write
    pub producer: CacheLineU32,
    /// Next slot to read
    pub consumer: CacheLineU32,
    /// Frames ever written
    pub sequence: CacheLineU64,
}

/// Metadata prefixing each slot's payload
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSlotHeader {
    pub sequence: u64,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
    /// Payload bytes stored after the header
    pub data_size: u32,
    /// Payload bytes after decoding
    pub original_size: u32,
    pub compression: u32,
    pub flags: u32,
}

const _: () = assert!(std::mem::size_of::<FrameSlotHeader>() <= SLOT_HEADER_SIZE);

pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Sizes derived from a retained-frame count and a payload capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Physical slots, one more than the frames retained
    pub slot_count: u32,
    pub slot_size: u32,
    pub data_offset: usize,
    pub total_size: usize,
}

impl RingGeometry {
    pub fn new(retained_frames: u32, max_frame_bytes: u32) -> Result<Self> {
        if retained_frames == 0 {
            return Err(Error::Config("ring must retain at least one frame".into()));
        }
        let slot_count = retained_frames
            .checked_add(1)
            .ok_or_else(|| Error::Config("slot count out of range".into()))?;

        let slot_size = round_up(SLOT_HEADER_SIZE + max_frame_bytes as usize, CACHE_LINE);
        let slot_size = u32::try_from(slot_size)
            .map_err(|_| Error::Config(format!("slot size {} exceeds 4 GiB", slot_size)))?;

        let data_offset = header_size();
        let total_size = (slot_count as usize)
            .checked_mul(slot_size as usize)
            .and_then(|slots| slots.checked_add(data_offset))
            .ok_or_else(|| Error::Config("segment size overflows".into()))?;

        Ok(Self {
            slot_count,
            slot_size,
            data_offset,
            total_size,
        })
    }

    /// Frames the ring holds before overwriting
    pub fn retained_frames(&self) -> u32 {
        self.slot_count - 1
    }

    /// Largest payload one slot accepts
    pub fn payload_capacity(&self) -> usize {
        self.slot_size as usize - SLOT_HEADER_SIZE
    }

    pub fn slot_offset(&self, index: u32) -> usize {
        self.data_offset + index as usize * self.slot_size as usize
    }

    /// Geometry recorded in an initialized header, checked for consistency
    /// with the mapped length.
    pub fn from_header(header: &SharedMemoryHeader, mapped_len: usize) -> Result<Self> {
        if header.magic != MAGIC {
            return Err(Error::HeaderMismatch(format!(
                "bad magic {:#010x}, expected {:#010x}",
                header.magic, MAGIC
            )));
        }
        if header.version != VERSION {
            return Err(Error::HeaderMismatch(format!(
                "version {} not supported, expected {}",
                header.version, VERSION
            )));
        }
        if header.slot_count < 2 || (header.slot_size as usize) <= SLOT_HEADER_SIZE {
            return Err(Error::HeaderMismatch(format!(
                "invalid slot geometry {} x {}",
                header.slot_count, header.slot_size
            )));
        }
        if header.data_offset as usize != header_size() {
            return Err(Error::HeaderMismatch(format!(
                "data offset {} does not match header size {}",
                header.data_offset,
                header_size()
            )));
        }

        let total_size = header.total_size as usize;
        let expected = header_size() + header.slot_count as usize * header.slot_size as usize;
        if total_size != expected {
            return Err(Error::HeaderMismatch(format!(
                "total size {} does not match slots ({})",
                total_size, expected
            )));
        }
        if total_size > mapped_len {
            return Err(Error::HeaderMismatch(format!(
                "segment declares {} bytes but only {} are mapped",
                total_size, mapped_len
            )));
        }

        Ok(Self {
            slot_count: header.slot_count,
            slot_size: header.slot_size,
            data_offset: header.data_offset as usize,
            total_size,
        })
    }
}

pub const fn header_size() -> usize {
    round_up(std::mem::size_of::<SharedMemoryHeader>(), CACHE_LINE)
}

/// Capability mask for a set of codecs. Plain copies are always possible.
pub fn capability_mask(kinds: impl IntoIterator<Item = CompressionType>) -> u32 {
    kinds
        .into_iter()
        .fold(CompressionType::None.capability_bit(), |mask, kind| {
            mask | kind.capability_bit()
        })
}
