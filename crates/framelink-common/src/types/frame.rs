//! Captured frame and transport types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Pixel format tag. Values are DXGI_FORMAT codes so frames can be handed
/// to graphics APIs without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const UNKNOWN: Self = Self(0);
    pub const R10G10B10A2_UNORM: Self = Self(24);
    pub const R8G8B8A8_UNORM: Self = Self(28);
    pub const R8G8B8A8_UNORM_SRGB: Self = Self(29);
    pub const B8G8R8A8_UNORM: Self = Self(87);
    pub const B8G8R8X8_UNORM: Self = Self(88);
    pub const B8G8R8A8_UNORM_SRGB: Self = Self(91);
    pub const R16G16B16A16_FLOAT: Self = Self(10);

    /// Bytes per pixel, when known
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::R16G16B16A16_FLOAT => Some(8),
            Self::R10G10B10A2_UNORM
            | Self::R8G8B8A8_UNORM
            | Self::R8G8B8A8_UNORM_SRGB
            | Self::B8G8R8A8_UNORM
            | Self::B8G8R8X8_UNORM
            | Self::B8G8R8A8_UNORM_SRGB => Some(4),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::R10G10B10A2_UNORM => "R10G10B10A2_UNORM",
            Self::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
            Self::R8G8B8A8_UNORM_SRGB => "R8G8B8A8_UNORM_SRGB",
            Self::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
            Self::B8G8R8X8_UNORM => "B8G8R8X8_UNORM",
            Self::B8G8R8A8_UNORM_SRGB => "B8G8R8A8_UNORM_SRGB",
            Self::R16G16B16A16_FLOAT => "R16G16B16A16_FLOAT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// One captured image plus the metadata needed to interpret it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameData {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including any driver padding
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture time in milliseconds since the UNIX epoch
    pub timestamp: u64,
    pub sequence: u64,
}

impl FrameData {
    /// Byte count a frame of these dimensions must carry
    pub fn expected_len(&self) -> usize {
        self.height as usize * self.stride as usize
    }

    pub fn is_complete(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.expected_len()
    }
}

/// Milliseconds since the UNIX epoch
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Payload encoding of a ring slot. The discriminant is the on-wire value
/// and the capability bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum CompressionType {
    #[default]
    None = 0,
    Rle = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CompressionType {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Rle),
            2 => Some(Self::Lz4),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Bit advertising this codec in the segment's capability mask
    pub fn capability_bit(self) -> u32 {
        1 << self.as_raw()
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Rle => "rle",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Counters kept by one transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub frames_written: u64,
    pub frames_read: u64,
    /// Unread frames discarded to make room
    pub frames_overwritten: u64,
    /// Frames refused because they did not fit a slot
    pub frames_rejected: u64,
    pub bytes_written: u64,
    /// Writes that stored a compressed payload
    pub frames_compressed: u64,
    /// Times the writer found corrupt indices and emptied the ring
    pub resets: u64,
}
