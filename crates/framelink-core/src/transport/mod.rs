//! Shared-memory frame ring
//!
//! Fixed slots in a named segment, written by the capture side and drained
//! by any number of external readers. A full ring overwrites its oldest
//! unread frame rather than blocking the producer, and a frame that does
//! not fit one slot is refused. The slot lock is held for the whole copy of
//! a slot, so a reader never sees a half-written frame.

pub mod compression;
pub mod layout;
pub mod lock;
pub mod segment;

use crate::transport::compression::{CodecSet, FrameCodec};
use crate::transport::layout::{
    capability_mask, FrameSlotHeader, RingGeometry, SharedMemoryHeader, MAGIC, SLOT_FLAG_VALID,
    SLOT_HEADER_SIZE, VERSION,
};
use crate::transport::lock::SharedRwLock;
use crate::transport::segment::Segment;
use framelink_common::{
    CompressionType, Error, FrameData, PixelFormat, Result, TransportConfig, TransportStats,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long an opener waits for the creator to publish the header
const READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest wait for the slot lock before a read or write gives up
const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Settings for creating or attaching to a ring
#[derive(Clone)]
pub struct TransportOptions {
    pub name: String,
    /// Frames retained before the oldest is overwritten
    pub slot_count: u32,
    pub max_frame_bytes: u32,
    pub compression: CompressionType,
    pub codecs: CodecSet,
}

impl TransportOptions {
    pub fn new(name: impl Into<String>) -> Self {
        let defaults = TransportConfig::default();
        Self {
            name: name.into(),
            slot_count: defaults.slot_count,
            max_frame_bytes: defaults.max_frame_bytes,
            compression: defaults.compression,
            codecs: CodecSet::default(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            name: config.name.clone(),
            slot_count: config.slot_count,
            max_frame_bytes: config.max_frame_bytes,
            compression: config.compression,
            codecs: CodecSet::default(),
        }
    }

    pub fn slot_count(mut self, slot_count: u32) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Make another codec available; advertised only if this endpoint
    /// creates the segment.
    pub fn codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codecs.register(codec);
        self
    }

    /// Replace the whole codec set
    pub fn codecs(mut self, codecs: CodecSet) -> Self {
        self.codecs = codecs;
        self
    }
}

pub struct SharedMemoryRingTransport {
    segment: Segment,
    geometry: RingGeometry,
    codecs: CodecSet,
    compression: AtomicU32,
    stats: Mutex<TransportStats>,
    scratch: Mutex<Vec<u8>>,
}

impl SharedMemoryRingTransport {
    /// Create the named ring, or attach to it if a peer created it first.
    ///
    /// The first endpoint initializes the header; later ones only validate
    /// it and use the geometry it records.
    pub fn create_or_open(options: TransportOptions) -> Result<Self> {
        let requested = RingGeometry::new(options.slot_count, options.max_frame_bytes)?;
        let segment = Segment::create_or_open(&options.name, requested.total_size)?;

        let geometry = if segment.is_creator() {
            let capabilities = capability_mask(options.codecs.kinds());
            // SAFETY: freshly created and sized for `requested`; no peer
            // reads it before `ready` is published.
            unsafe { initialize_header(segment.as_ptr(), &requested, capabilities) };
            info!(
                target: "framelink_core::ring",
                name = %options.name,
                slots = requested.slot_count,
                slot_size = requested.slot_size,
                total = requested.total_size,
                capabilities = format_args!("{:#06b}", capabilities),
                "Frame ring created"
            );
            requested
        } else {
            let geometry = attach_geometry(&segment)?;
            if geometry != requested {
                info!(
                    target: "framelink_core::ring",
                    name = %options.name,
                    slots = geometry.slot_count,
                    slot_size = geometry.slot_size,
                    "Attached to existing ring with its own geometry"
                );
            }
            geometry
        };

        let transport = Self::from_parts(segment, geometry, options.codecs);
        if options.compression != CompressionType::None {
            if let Err(e) = transport.set_compression(options.compression) {
                warn!(
                    target: "framelink_core::ring",
                    requested = %options.compression,
                    error = %e,
                    "Compression not negotiated, storing frames uncompressed"
                );
            }
        }
        Ok(transport)
    }

    /// Attach to an existing ring. Used by readers, which must never
    /// create a segment with guessed geometry.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with_codecs(name, CodecSet::default())
    }

    pub fn open_with_codecs(name: &str, codecs: CodecSet) -> Result<Self> {
        let segment = Segment::open(name)?;
        let geometry = attach_geometry(&segment)?;
        debug!(
            target: "framelink_core::ring",
            name,
            slots = geometry.slot_count,
            slot_size = geometry.slot_size,
            "Attached to frame ring"
        );
        Ok(Self::from_parts(segment, geometry, codecs))
    }

    fn from_parts(segment: Segment, geometry: RingGeometry, codecs: CodecSet) -> Self {
        Self {
            segment,
            geometry,
            codecs,
            compression: AtomicU32::new(CompressionType::None.as_raw()),
            stats: Mutex::new(TransportStats::default()),
            scratch: Mutex::new(Vec::new()),
        }
    }

    fn header(&self) -> &SharedMemoryHeader {
        // SAFETY: the segment is at least `total_size` long, page aligned,
        // and the header was published before this endpoint attached.
        unsafe { &*(self.segment.as_ptr() as *const SharedMemoryHeader) }
    }

    fn lock(&self) -> SharedRwLock<'_> {
        SharedRwLock::new(&self.header().lock.value)
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < slot_count, so the slot lies inside the segment.
        unsafe { self.segment.as_ptr().add(self.geometry.slot_offset(index)) }
    }

    /// Producer and consumer as published in the header. Any peer can
    /// write them, so both are range checked before they index a slot.
    fn indices(&self) -> Result<(u32, u32)> {
        let header = self.header();
        let producer = header.producer.value.load(Ordering::Acquire);
        let consumer = header.consumer.value.load(Ordering::Acquire);
        if producer >= self.geometry.slot_count || consumer >= self.geometry.slot_count {
            return Err(Error::Transport(format!(
                "corrupt ring index (producer {}, consumer {}, slots {})",
                producer, consumer, self.geometry.slot_count
            )));
        }
        Ok((producer, consumer))
    }

    fn next_index(&self, index: u32) -> u32 {
        (index + 1) % self.geometry.slot_count
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn is_creator(&self) -> bool {
        self.segment.is_creator()
    }

    /// Frames the ring retains before overwriting
    pub fn capacity(&self) -> u32 {
        self.geometry.retained_frames()
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    /// Largest encoded payload a slot accepts
    pub fn max_payload(&self) -> usize {
        self.geometry.payload_capacity()
    }

    /// Codecs the segment's creator advertised
    pub fn capabilities(&self) -> u32 {
        self.header().capabilities
    }

    pub fn compression(&self) -> CompressionType {
        CompressionType::from_raw(self.compression.load(Ordering::Relaxed))
            .unwrap_or(CompressionType::None)
    }

    /// Switch payload encoding. Refused, leaving the current setting, when
    /// the segment does not advertise `kind` or no codec for it is
    /// registered here.
    pub fn set_compression(&self, kind: CompressionType) -> Result<()> {
        if self.capabilities() & kind.capability_bit() == 0 {
            return Err(Error::CompressionUnsupported(format!(
                "{} not advertised by segment {}",
                kind,
                self.name()
            )));
        }
        if !self.codecs.supports(kind) {
            return Err(Error::CompressionUnsupported(format!(
                "no {} codec registered in this process",
                kind
            )));
        }
        self.compression.store(kind.as_raw(), Ordering::Relaxed);
        debug!(target: "framelink_core::ring", compression = %kind, "Compression set");
        Ok(())
    }

    /// Frames ever written to the segment, by any producer
    pub fn sequence(&self) -> u64 {
        self.header().sequence.value.load(Ordering::Acquire)
    }

    /// Unread frames currently in the ring
    /// Unread frames; a ring with corrupt indices reports none
    pub fn pending(&self) -> u32 {
        match self.indices() {
            Ok((producer, consumer)) => {
                (producer + self.geometry.slot_count - consumer) % self.geometry.slot_count
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn stats(&self) -> TransportStats {
        *self.stats.lock()
    }

    /// Store one frame, overwriting the oldest unread one when full.
    /// Returns the ring sequence number assigned to it.
    pub fn write_frame(&self, frame: &FrameData) -> Result<u64> {
        let original_size = u32::try_from(frame.data.len()).map_err(|_| Error::FrameTooLarge {
            required: frame.data.len(),
            capacity: self.max_payload(),
        })?;

        let requested = self.compression();
        let mut scratch = self.scratch.lock();
        let compressed = match self.codecs.encode(requested, &frame.data, &mut scratch) {
            Ok(compressed) => compressed,
            Err(e) => {
                debug!(
                    target: "framelink_core::ring",
                    error = %e,
                    "Compression failed, storing frame as is"
                );
                false
            }
        };
        let (payload, kind): (&[u8], CompressionType) = if compressed {
            (&scratch, requested)
        } else {
            (&frame.data, CompressionType::None)
        };

        let required = SLOT_HEADER_SIZE + payload.len();
        if required > self.geometry.slot_size as usize {
            self.stats.lock().frames_rejected += 1;
            warn!(
                target: "framelink_core::ring",
                required,
                capacity = self.geometry.slot_size,
                width = frame.width,
                height = frame.height,
                "Frame too large for slot, dropped"
            );
            return Err(Error::FrameTooLarge {
                required,
                capacity: self.geometry.slot_size as usize,
            });
        }

        let header = self.header();
        let overwritten;
        let sequence;
        {
            let _guard = self.lock().write(LOCK_TIMEOUT)?;

            let (producer, consumer) = match self.indices() {
                Ok(indices) => indices,
                Err(e) => {
                    // Unread frames cannot be trusted once the indices are
                    // garbage; restart the ring empty
                    warn!(target: "framelink_core::ring", error = %e, "Resetting frame ring");
                    self.stats.lock().resets += 1;
                    header.consumer.value.store(0, Ordering::Release);
                    header.producer.value.store(0, Ordering::Release);
                    (0, 0)
                }
            };
            let next = self.next_index(producer);
            overwritten = next == consumer;
            if overwritten {
                header
                    .consumer
                    .value
                    .store(self.next_index(consumer), Ordering::Release);
            }

            sequence = header.sequence.value.fetch_add(1, Ordering::AcqRel);
            let slot_header = FrameSlotHeader {
                sequence,
                timestamp: frame.timestamp,
                width: frame.width,
                height: frame.height,
                stride: frame.stride,
                format: frame.format.0,
                data_size: payload.len() as u32,
                original_size,
                compression: kind.as_raw(),
                flags: SLOT_FLAG_VALID,
            };

            let slot = self.slot_ptr(producer);
            // SAFETY: the write lock is held and the payload fits the slot.
            unsafe {
                std::ptr::write_unaligned(slot as *mut FrameSlotHeader, slot_header);
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    slot.add(SLOT_HEADER_SIZE),
                    payload.len(),
                );
            }

            header.producer.value.store(next, Ordering::Release);
        }
        self.segment.signal();

        let mut stats = self.stats.lock();
        stats.frames_written += 1;
        stats.bytes_written += payload.len() as u64;
        if overwritten {
            stats.frames_overwritten += 1;
        }
        if kind != CompressionType::None {
            stats.frames_compressed += 1;
        }
        Ok(sequence)
    }

    /// Take the oldest unread frame into `out`. Returns `false` when the
    /// ring is empty.
    pub fn read_frame_into(&self, out: &mut FrameData) -> Result<bool> {
        let header = self.header();
        let mut raw = Vec::new();

        let slot_header = {
            let _guard = self.lock().read(LOCK_TIMEOUT)?;
            loop {
                let (producer, consumer) = self.indices()?;
                if consumer == producer {
                    return Ok(false);
                }

                let slot = self.slot_ptr(consumer);
                // SAFETY: the read lock excludes writers for the whole copy.
                let slot_header = unsafe { std::ptr::read_unaligned(slot as *const FrameSlotHeader) };
                let data_size = slot_header.data_size as usize;
                let valid = slot_header.flags & SLOT_FLAG_VALID != 0
                    && data_size <= self.geometry.payload_capacity();
                if valid {
                    raw.clear();
                    raw.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(slot.add(SLOT_HEADER_SIZE), data_size)
                    });
                }

                // Another reader may have taken this slot meanwhile
                if header
                    .consumer
                    .value
                    .compare_exchange(
                        consumer,
                        self.next_index(consumer),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }

                if !valid {
                    return Err(Error::Transport(format!(
                        "slot {} holds a corrupt header (size {}, flags {:#x})",
                        consumer, data_size, slot_header.flags
                    )));
                }
                break slot_header;
            }
        };

        let kind = CompressionType::from_raw(slot_header.compression).ok_or_else(|| {
            Error::Codec(format!("unknown compression tag {}", slot_header.compression))
        })?;
        self.codecs
            .decode(kind, &raw, slot_header.original_size as usize, &mut out.data)?;

        out.width = slot_header.width;
        out.height = slot_header.height;
        out.stride = slot_header.stride;
        out.format = PixelFormat(slot_header.format);
        out.timestamp = slot_header.timestamp;
        out.sequence = slot_header.sequence;

        self.stats.lock().frames_read += 1;
        Ok(true)
    }

    /// Take the oldest unread frame, if any
    pub fn read_frame(&self) -> Result<Option<FrameData>> {
        let mut frame = FrameData::default();
        Ok(self.read_frame_into(&mut frame)?.then_some(frame))
    }

    /// Block up to `timeout` until a frame is available to read
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        self.segment.wait_until(timeout, || !self.is_empty())
    }

    /// Detach from the segment
    pub fn close(self) {
        debug!(
            target: "framelink_core::ring",
            name = %self.name(),
            stats = ?self.stats(),
            "Frame ring closed"
        );
    }
}

/// Write a fresh header and publish it
///
/// # Safety
/// `base` must point to at least `geometry.total_size` writable bytes that
/// no peer is reading yet.
unsafe fn initialize_header(base: *mut u8, geometry: &RingGeometry, capabilities: u32) {
    let header = base as *mut SharedMemoryHeader;
    std::ptr::addr_of_mut!((*header).magic).write(MAGIC);
    std::ptr::addr_of_mut!((*header).version).write(VERSION);
    std::ptr::addr_of_mut!((*header).total_size).write(geometry.total_size as u64);
    std::ptr::addr_of_mut!((*header).data_offset).write(geometry.data_offset as u64);
    std::ptr::addr_of_mut!((*header).slot_count).write(geometry.slot_count);
    std::ptr::addr_of_mut!((*header).slot_size).write(geometry.slot_size);
    std::ptr::addr_of_mut!((*header).capabilities).write(capabilities);

    let header = &*header;
    header.lock.value.store(0, Ordering::Relaxed);
    header.producer.value.store(0, Ordering::Relaxed);
    header.consumer.value.store(0, Ordering::Relaxed);
    header.sequence.value.store(0, Ordering::Relaxed);
    header.ready.store(1, Ordering::Release);
}

/// Wait for the creator to publish the header, then validate it
fn attach_geometry(segment: &Segment) -> Result<RingGeometry> {
    if segment.len() < layout::header_size() {
        return Err(Error::HeaderMismatch(format!(
            "segment {} is only {} bytes",
            segment.name(),
            segment.len()
        )));
    }

    let header = segment.as_ptr() as *const SharedMemoryHeader;
    // SAFETY: the segment holds at least a header; `ready` is atomic.
    let ready = unsafe { &(*header).ready };
    let deadline = Instant::now() + READY_TIMEOUT;
    while ready.load(Ordering::Acquire) == 0 {
        if Instant::now() >= deadline {
            return Err(Error::HeaderMismatch(format!(
                "segment {} was never initialized",
                segment.name()
            )));
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    // SAFETY: published and immutable from here on.
    RingGeometry::from_header(unsafe { &*header }, segment.len())
}

#[cfg(test)]
mod tests {
    use super::compression::testing::XorCodec;
    use super::compression::RleCodec;
    use super::*;

    fn unique(name: &str) -> String {
        format!("ring-test-{}-{}", name, std::process::id())
    }

    fn frame(marker: u8, width: u32, height: u32) -> FrameData {
        let stride = width * 4;
        FrameData {
            data: vec![marker; (stride * height) as usize],
            width,
            height,
            stride,
            format: PixelFormat::B8G8R8A8_UNORM,
            timestamp: 1_700_000_000_000 + marker as u64,
            sequence: marker as u64,
        }
    }

    fn small_ring(name: &str, slots: u32) -> SharedMemoryRingTransport {
        SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(unique(name))
                .slot_count(slots)
                .max_frame_bytes(64 * 64 * 4),
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let ring = small_ring("basic", 4);
        assert!(ring.is_creator());
        assert!(ring.read_frame().unwrap().is_none());

        let written = frame(3, 16, 8);
        ring.write_frame(&written).unwrap();
        assert_eq!(ring.pending(), 1);

        let read = ring.read_frame().unwrap().unwrap();
        assert_eq!(read.data, written.data);
        assert_eq!(read.width, 16);
        assert_eq!(read.height, 8);
        assert_eq!(read.stride, 64);
        assert_eq!(read.format, PixelFormat::B8G8R8A8_UNORM);
        assert_eq!(read.timestamp, written.timestamp);
        assert!(ring.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_overwrite_oldest() {
        let ring = small_ring("overwrite", 4);
        for marker in 1..=5 {
            ring.write_frame(&frame(marker, 8, 8)).unwrap();
        }
        assert_eq!(ring.pending(), 4);
        assert_eq!(ring.stats().frames_overwritten, 1);

        let mut last = None;
        for expected in 2..=5u8 {
            let read = ring.read_frame().unwrap().unwrap();
            assert_eq!(read.data[0], expected);
            if let Some(previous) = last {
                assert!(read.sequence > previous);
            }
            last = Some(read.sequence);
        }
        assert!(ring.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large_rejected() {
        let ring = small_ring("too-large", 2);
        let err = ring.write_frame(&frame(1, 65, 64)).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
        assert_eq!(ring.stats().frames_rejected, 1);
        assert!(ring.is_empty());
        assert_eq!(ring.sequence(), 0);
    }

    #[test]
    fn test_rle_round_trip_and_fallback() {
        let ring = small_ring("rle", 4);
        ring.set_compression(CompressionType::Rle).unwrap();

        let flat = frame(0x40, 32, 32);
        ring.write_frame(&flat).unwrap();
        let mut noisy = frame(0, 8, 8);
        for (i, b) in noisy.data.iter_mut().enumerate() {
            *b = i as u8;
        }
        ring.write_frame(&noisy).unwrap();

        assert_eq!(ring.stats().frames_compressed, 1);
        assert_eq!(ring.read_frame().unwrap().unwrap().data, flat.data);
        assert_eq!(ring.read_frame().unwrap().unwrap().data, noisy.data);
    }

    #[test]
    fn test_unadvertised_compression_refused() {
        let ring = SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(unique("caps"))
                .slot_count(2)
                .max_frame_bytes(4096)
                .codecs(CodecSet::empty().with(Arc::new(RleCodec))),
        )
        .unwrap();
        assert_eq!(ring.capabilities(), 0b0011);
        let err = ring.set_compression(CompressionType::Zstd).unwrap_err();
        assert!(matches!(err, Error::CompressionUnsupported(_)));
        assert_eq!(ring.compression(), CompressionType::None);
    }

    #[test]
    fn test_registered_codec_advertised() {
        let name = unique("codec");
        let writer = SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(name.clone())
                .slot_count(2)
                .max_frame_bytes(4096)
                .codecs(CodecSet::empty())
                .codec(Arc::new(XorCodec {
                    kind: CompressionType::Lz4,
                }))
                .compression(CompressionType::Lz4),
        )
        .unwrap();
        assert_eq!(writer.compression(), CompressionType::Lz4);
        assert_eq!(writer.capabilities(), 0b0101);

        // Advertised by the segment, but this reader has no such codec
        let reader = SharedMemoryRingTransport::open_with_codecs(&name, CodecSet::empty()).unwrap();
        assert!(reader.set_compression(CompressionType::Lz4).is_err());

        writer.write_frame(&frame(9, 8, 8)).unwrap();
        assert!(matches!(
            reader.read_frame(),
            Err(Error::CompressionUnsupported(_))
        ));
    }

    #[test]
    fn test_second_endpoint_shares_ring() {
        let name = unique("shared");
        let writer = SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(name.clone())
                .slot_count(3)
                .max_frame_bytes(1024),
        )
        .unwrap();
        // Different requested geometry; the header wins
        let reader = SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(name).slot_count(8).max_frame_bytes(4096),
        )
        .unwrap();
        assert!(!reader.is_creator());
        assert_eq!(reader.capacity(), 3);

        writer.write_frame(&frame(7, 4, 4)).unwrap();
        assert!(reader.wait_for_frame(Duration::from_millis(100)));
        let read = reader.read_frame().unwrap().unwrap();
        assert_eq!(read.data, vec![7; 64]);
        assert_eq!(reader.stats().frames_read, 1);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let ring = small_ring("wait", 2);
        let start = Instant::now();
        assert!(!ring.wait_for_frame(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_open_missing_ring_fails() {
        assert!(SharedMemoryRingTransport::open(&unique("absent")).is_err());
    }

    #[test]
    fn test_concurrent_reader_sees_whole_frames() {
        let name = unique("torn");
        let writer = Arc::new(small_ring_named(&name));
        let reader = SharedMemoryRingTransport::open(&name).unwrap();

        let producer = {
            let writer = writer.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    writer.write_frame(&frame((i % 250) as u8 + 1, 16, 16)).unwrap();
                }
            })
        };

        let check = |f: &FrameData| {
            assert_eq!(f.data.len(), f.expected_len());
            assert!(f.data.iter().all(|&b| b == f.data[0]));
        };

        let mut seen = 0;
        while !producer.is_finished() {
            if let Some(f) = reader.read_frame().unwrap() {
                check(&f);
                seen += 1;
            }
        }
        producer.join().unwrap();

        // Whatever the writer left behind is still readable
        while let Some(f) = reader.read_frame().unwrap() {
            check(&f);
            seen += 1;
        }
        assert!(seen >= writer.capacity() as usize);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_corrupt_indices_rejected_by_reader() {
        let ring = small_ring("bad-consumer", 4);
        ring.write_frame(&frame(1, 8, 8)).unwrap();
        ring.header().consumer.value.store(1_000_000, Ordering::Release);

        let err = ring.read_frame().unwrap_err();
        assert!(matches!(err, Error::Transport(ref msg) if msg.contains("corrupt ring index")));
    }

    #[test]
    fn test_writer_resets_corrupt_indices() {
        let ring = small_ring("bad-producer", 4);
        let peer = SharedMemoryRingTransport::open(ring.name()).unwrap();
        ring.write_frame(&frame(1, 8, 8)).unwrap();
        peer.header().producer.value.store(1_000_000, Ordering::Release);

        ring.write_frame(&frame(2, 8, 8)).unwrap();
        assert_eq!(ring.stats().resets, 1);
        assert_eq!(ring.pending(), 1);

        let survivor = peer.read_frame().unwrap().unwrap();
        assert_eq!(survivor.data[0], 2);
        assert!(peer.read_frame().unwrap().is_none());
    }

    fn small_ring_named(name: &str) -> SharedMemoryRingTransport {
        SharedMemoryRingTransport::create_or_open(
            TransportOptions::new(name).slot_count(4).max_frame_bytes(64 * 64 * 4),
        )
        .unwrap()
    }
}
