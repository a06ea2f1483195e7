//! Payload codecs
//!
//! Run-length encoding is always built in. LZ4 and Zstandard come with the
//! `lz4` and `zstd` features, both on by default. Callers may register
//! further [`FrameCodec`]s; a kind is advertised only when registered.

use framelink_common::{CompressionType, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub trait FrameCodec: Send + Sync {
    fn kind(&self) -> CompressionType;

    /// Encode `input` into `output`. Returns `false`, leaving `output` in an
    /// unspecified state, when the result would not be smaller than `limit`.
    fn compress(&self, input: &[u8], limit: usize, output: &mut Vec<u8>) -> Result<bool>;

    /// Decode `input` into `output`, which must end up `original_size` long
    fn decompress(&self, input: &[u8], original_size: usize, output: &mut Vec<u8>) -> Result<()>;
}

/// `(count, byte)` pairs, runs capped at 255
#[derive(Debug, Default, Clone, Copy)]
pub struct RleCodec;

impl FrameCodec for RleCodec {
    fn kind(&self) -> CompressionType {
        CompressionType::Rle
    }

    fn compress(&self, input: &[u8], limit: usize, output: &mut Vec<u8>) -> Result<bool> {
        output.clear();
        let mut i = 0;
        while i < input.len() {
            let value = input[i];
            let mut run = 1;
            while run < 255 && i + run < input.len() && input[i + run] == value {
                run += 1;
            }
            if output.len() + 2 >= limit {
                return Ok(false);
            }
            output.push(run as u8);
            output.push(value);
            i += run;
        }
        Ok(output.len() < limit)
    }

    fn decompress(&self, input: &[u8], original_size: usize, output: &mut Vec<u8>) -> Result<()> {
        if input.len() % 2 != 0 {
            return Err(Error::Codec("run-length payload has odd length".into()));
        }
        output.clear();
        output.reserve(original_size);
        for pair in input.chunks_exact(2) {
            let (run, value) = (pair[0] as usize, pair[1]);
            if run == 0 || output.len() + run > original_size {
                return Err(Error::Codec("run-length payload overruns frame".into()));
            }
            output.resize(output.len() + run, value);
        }
        if output.len() != original_size {
            return Err(Error::Codec(format!(
                "run-length payload decoded to {} bytes, expected {}",
                output.len(),
                original_size
            )));
        }
        Ok(())
    }
}

/// LZ4 block format, sized by the slot's `original_size`
#[cfg(feature = "lz4")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

#[cfg(feature = "lz4")]
impl FrameCodec for Lz4Codec {
    fn kind(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, input: &[u8], limit: usize, output: &mut Vec<u8>) -> Result<bool> {
        output.clear();
        output.resize(lz4_flex::block::get_maximum_output_size(input.len()), 0);
        let written = lz4_flex::block::compress_into(input, output)
            .map_err(|e| Error::Codec(format!("lz4: {}", e)))?;
        output.truncate(written);
        Ok(written < limit)
    }

    fn decompress(&self, input: &[u8], original_size: usize, output: &mut Vec<u8>) -> Result<()> {
        output.clear();
        output.resize(original_size, 0);
        let written = lz4_flex::block::decompress_into(input, output)
            .map_err(|e| Error::Codec(format!("lz4: {}", e)))?;
        if written != original_size {
            return Err(Error::Codec(format!(
                "lz4 payload decoded to {} bytes, expected {}",
                written, original_size
            )));
        }
        Ok(())
    }
}

/// Zstandard single-shot frames
#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

#[cfg(feature = "zstd")]
impl ZstdCodec {
    /// Fast levels keep up with the present rate
    pub const DEFAULT_LEVEL: i32 = 1;

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "zstd")]
impl Default for ZstdCodec {
    fn default() -> Self {
        Self::with_level(Self::DEFAULT_LEVEL)
    }
}

#[cfg(feature = "zstd")]
impl FrameCodec for ZstdCodec {
    fn kind(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, input: &[u8], limit: usize, output: &mut Vec<u8>) -> Result<bool> {
        *output = zstd::bulk::compress(input, self.level)
            .map_err(|e| Error::Codec(format!("zstd: {}", e)))?;
        Ok(output.len() < limit)
    }

    fn decompress(&self, input: &[u8], original_size: usize, output: &mut Vec<u8>) -> Result<()> {
        *output = zstd::bulk::decompress(input, original_size)
            .map_err(|e| Error::Codec(format!("zstd: {}", e)))?;
        if output.len() != original_size {
            return Err(Error::Codec(format!(
                "zstd payload decoded to {} bytes, expected {}",
                output.len(),
                original_size
            )));
        }
        Ok(())
    }
}

/// Codecs available to one transport endpoint
#[derive(Clone)]
pub struct CodecSet {
    codecs: HashMap<CompressionType, Arc<dyn FrameCodec>>,
}

impl Default for CodecSet {
    /// Every codec compiled in
    fn default() -> Self {
        let mut set = Self::empty();
        set.register(Arc::new(RleCodec));
        #[cfg(feature = "lz4")]
        set.register(Arc::new(Lz4Codec));
        #[cfg(feature = "zstd")]
        set.register(Arc::new(ZstdCodec::default()));
        set
    }
}

impl CodecSet {
    /// Raw payloads only
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn with(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.register(codec);
        self
    }

    pub fn register(&mut self, codec: Arc<dyn FrameCodec>) {
        self.codecs.insert(codec.kind(), codec);
    }

    pub fn get(&self, kind: CompressionType) -> Option<&Arc<dyn FrameCodec>> {
        self.codecs.get(&kind)
    }

    pub fn supports(&self, kind: CompressionType) -> bool {
        kind == CompressionType::None || self.codecs.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = CompressionType> + '_ {
        self.codecs.keys().copied()
    }

    /// Encode `input` with `kind` into `scratch`. `false` means store the
    /// original bytes instead.
    pub fn encode(&self, kind: CompressionType, input: &[u8], scratch: &mut Vec<u8>) -> Result<bool> {
        if kind == CompressionType::None || input.is_empty() {
            return Ok(false);
        }
        let codec = self
            .get(kind)
            .ok_or_else(|| Error::CompressionUnsupported(kind.to_string()))?;
        codec.compress(input, input.len(), scratch)
    }

    pub fn decode(
        &self,
        kind: CompressionType,
        input: &[u8],
        original_size: usize,
        output: &mut Vec<u8>,
    ) -> Result<()> {
        if kind == CompressionType::None {
            output.clear();
            output.extend_from_slice(input);
            return Ok(());
        }
        let codec = self
            .get(kind)
            .ok_or_else(|| Error::CompressionUnsupported(kind.to_string()))?;
        codec.decompress(input, original_size, output)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rle_round_trip() {
        let mut input = vec![0u8; 1000];
        input[500..600].fill(0xFF);
        input[999] = 7;

        let mut encoded = Vec::new();
        assert!(RleCodec.compress(&input, input.len(), &mut encoded).unwrap());
        assert!(encoded.len() < input.len());

        let mut decoded = Vec::new();
        RleCodec.decompress(&encoded, input.len(), &mut decoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_rle_runs_capped() {
        let input = vec![9u8; 600];
        let mut encoded = Vec::new();
        assert!(RleCodec.compress(&input, input.len(), &mut encoded).unwrap());
        assert_eq!(encoded, vec![255, 9, 255, 9, 90, 9]);
    }

    #[test]
    fn test_rle_gives_up_on_noise() {
        let input: Vec<u8> = (0..=255u8).collect();
        let mut encoded = Vec::new();
        assert!(!RleCodec.compress(&input, input.len(), &mut encoded).unwrap());
    }

    #[test]
    fn test_rle_rejects_corrupt_input() {
        let mut out = Vec::new();
        assert!(RleCodec.decompress(&[3], 3, &mut out).is_err());
        assert!(RleCodec.decompress(&[0, 1], 0, &mut out).is_err());
        assert!(RleCodec.decompress(&[4, 1], 3, &mut out).is_err());
        assert!(RleCodec.decompress(&[2, 1], 3, &mut out).is_err());
    }

    #[test]
    fn test_codec_set_defaults() {
        let set = CodecSet::default();
        assert!(set.supports(CompressionType::None));
        assert!(set.supports(CompressionType::Rle));
        assert_eq!(set.supports(CompressionType::Lz4), cfg!(feature = "lz4"));
        assert_eq!(set.supports(CompressionType::Zstd), cfg!(feature = "zstd"));
    }

    #[test]
    fn test_empty_set_refuses_codecs() {
        let set = CodecSet::empty();
        assert!(set.supports(CompressionType::None));
        assert_eq!(set.kinds().count(), 0);

        let mut scratch = Vec::new();
        assert!(matches!(
            set.encode(CompressionType::Zstd, &[1, 2, 3], &mut scratch),
            Err(Error::CompressionUnsupported(_))
        ));
        assert!(!set.encode(CompressionType::None, &[1, 2, 3], &mut scratch).unwrap());
    }

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 97) as u8).collect()
    }

    fn assert_round_trip(codec: &dyn FrameCodec, input: &[u8]) {
        let mut encoded = Vec::new();
        assert!(codec.compress(input, input.len(), &mut encoded).unwrap());
        assert!(encoded.len() < input.len());

        let mut decoded = Vec::new();
        codec.decompress(&encoded, input.len(), &mut decoded).unwrap();
        assert_eq!(decoded, input);

        // A wrong size hint is a codec error, never a short frame
        assert!(codec.decompress(&encoded, input.len() + 1, &mut decoded).is_err());
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_lz4_round_trip() {
        assert_round_trip(&Lz4Codec, &gradient(64 * 64 * 4));
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_lz4_rejects_garbage() {
        let mut out = Vec::new();
        assert!(Lz4Codec.decompress(&[0xF0, 1, 2], 4096, &mut out).is_err());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd_round_trip() {
        assert_round_trip(&ZstdCodec::default(), &gradient(64 * 64 * 4));
        assert_round_trip(&ZstdCodec::with_level(9), &vec![0x7F; 10_000]);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd_rejects_garbage() {
        let mut out = Vec::new();
        assert!(ZstdCodec::default().decompress(b"not zstd", 64, &mut out).is_err());
    }

    #[test]
    fn test_registered_codec() {
        let mut set = CodecSet::empty();
        set.register(Arc::new(testing::XorCodec {
            kind: CompressionType::Lz4,
        }));
        assert!(set.supports(CompressionType::Lz4));

        let input = vec![3u8; 64];
        let mut scratch = Vec::new();
        assert!(set.encode(CompressionType::Lz4, &input, &mut scratch).unwrap());
        let mut out = Vec::new();
        set.decode(CompressionType::Lz4, &scratch, input.len(), &mut out).unwrap();
        assert_eq!(out, input);
    }
}
