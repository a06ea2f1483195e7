//! Back-buffer capture
//!
//! Each capture copies the swap chain's back buffer into a CPU-readable
//! staging texture, maps it, and copies `height * row_pitch` bytes out.
//! The staging texture is reused until the size, format or device changes.
//! A failed step abandons that frame only; the cached texture is kept.

use crate::callbacks::CallbackRegistry;
use crate::transport::SharedMemoryRingTransport;
use framelink_common::{timestamp_millis, Error, FrameData, PixelFormat, Result};
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What a staging surface was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Identity of the owning device
    pub device: usize,
}

/// Lazily (re)created staging surface
pub struct StagingCache<T> {
    current: Option<(StagingKey, T)>,
    allocations: u64,
}

impl<T> Default for StagingCache<T> {
    fn default() -> Self {
        Self {
            current: None,
            allocations: 0,
        }
    }
}

impl<T> StagingCache<T> {
    /// Surface for `key`, creating one only when `key` differs from the
    /// cached one. On failure the previous surface stays cached.
    pub fn ensure(
        &mut self,
        key: StagingKey,
        create: impl FnOnce(&StagingKey) -> Result<T>,
    ) -> Result<&T> {
        let reusable = matches!(&self.current, Some((cached, _)) if *cached == key);
        if !reusable {
            let surface = create(&key)?;
            self.allocations += 1;
            debug!(
                target: "framelink_core::extractor",
                width = key.width,
                height = key.height,
                format = %key.format,
                "Staging surface allocated"
            );
            self.current = Some((key, surface));
        }
        match &self.current {
            Some((_, surface)) => Ok(surface),
            None => Err(Error::Internal("staging cache empty after ensure".into())),
        }
    }

    pub fn key(&self) -> Option<StagingKey> {
        self.current.as_ref().map(|(key, _)| *key)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub presents: u64,
    pub captured: u64,
    pub failed: u64,
    /// Transport writes that were refused
    pub transport_errors: u64,
}

pub struct FrameExtractor {
    staging: StagingCache<platform::StagingSurface>,
    callbacks: Arc<CallbackRegistry>,
    transport: Option<Arc<SharedMemoryRingTransport>>,
    frame_interval: u32,
    sequence: u64,
    stats: ExtractorStats,
}

impl FrameExtractor {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            staging: StagingCache::default(),
            callbacks,
            transport: None,
            frame_interval: 1,
            sequence: 0,
            stats: ExtractorStats::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<SharedMemoryRingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Capture every `interval`th present; 0 is treated as 1
    pub fn with_frame_interval(mut self, interval: u32) -> Self {
        self.frame_interval = interval.max(1);
        self
    }

    pub fn transport(&self) -> Option<&Arc<SharedMemoryRingTransport>> {
        self.transport.as_ref()
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    pub fn staging_allocations(&self) -> u64 {
        self.staging.allocations()
    }

    /// Copy a mapped image into a new frame and stamp it
    pub fn package(
        &mut self,
        mapped: &[u8],
        row_pitch: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<FrameData> {
        let len = height as usize * row_pitch as usize;
        if len == 0 || mapped.len() < len {
            return Err(Error::Capture(format!(
                "mapped image holds {} bytes, {}x{} at pitch {} needs {}",
                mapped.len(),
                width,
                height,
                row_pitch,
                len
            )));
        }

        let frame = FrameData {
            data: mapped[..len].to_vec(),
            width,
            height,
            stride: row_pitch,
            format,
            timestamp: timestamp_millis(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.stats.captured += 1;
        Ok(frame)
    }

    /// Capture the current back buffer of `swap_chain`
    ///
    /// # Safety
    /// `swap_chain` must be a live `IDXGISwapChain`.
    pub unsafe fn extract(&mut self, swap_chain: *mut c_void) -> Result<FrameData> {
        if swap_chain.is_null() {
            return Err(Error::InvalidAddress(0));
        }
        platform::extract(self, swap_chain)
    }

    /// Hand a frame to the callbacks and, separately, to the transport
    pub fn deliver(&mut self, frame: &FrameData) {
        self.callbacks.dispatch(&frame.data, frame.width, frame.height);

        if let Some(transport) = &self.transport {
            if let Err(e) = transport.write_frame(frame) {
                self.stats.transport_errors += 1;
                debug!(
                    target: "framelink_core::extractor",
                    sequence = frame.sequence,
                    error = %e,
                    "Frame not exported"
                );
            }
        }
    }

    /// Present hook entry point. Never fails; a frame that cannot be
    /// captured is skipped.
    ///
    /// # Safety
    /// `swap_chain` must be the live swap chain being presented.
    pub unsafe fn on_present(&mut self, swap_chain: *mut c_void) {
        self.stats.presents += 1;
        if (self.stats.presents - 1) % self.frame_interval as u64 != 0 {
            return;
        }

        match self.extract(swap_chain) {
            Ok(frame) => {
                trace!(
                    target: "framelink_core::extractor",
                    sequence = frame.sequence,
                    width = frame.width,
                    height = frame.height,
                    "Frame captured"
                );
                self.deliver(&frame);
            }
            Err(e) => {
                self.stats.failed += 1;
                // Every failure on a 60 Hz thread would flood the log
                if self.stats.failed.is_power_of_two() {
                    warn!(
                        target: "framelink_core::extractor",
                        failures = self.stats.failed,
                        error = %e,
                        "Frame capture failed"
                    );
                }
            }
        }
    }

    /// Release the staging surface
    pub fn reset(&mut self) {
        self.staging.clear();
        info!(
            target: "framelink_core::extractor",
            stats = ?self.stats,
            "Frame extractor reset"
        );
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use super::{FrameExtractor, StagingKey};
    use framelink_common::{Error, PixelFormat, Result};
    use std::ffi::c_void;
    use windows::core::Interface;
    use windows::Win32::Graphics::Direct3D11::{
        ID3D11Device, ID3D11Texture2D, D3D11_CPU_ACCESS_READ, D3D11_MAPPED_SUBRESOURCE,
        D3D11_MAP_READ, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
    };
    use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
    use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

    /// Staging texture, only touched while the extractor is borrowed
    #[derive(Clone)]
    pub struct StagingSurface(ID3D11Texture2D);

    unsafe impl Send for StagingSurface {}

    fn capture_error(step: &'static str) -> impl Fn(windows::core::Error) -> Error {
        move |e| Error::Capture(format!("{} failed: {}", step, e))
    }

    fn create_staging(device: &ID3D11Device, key: &StagingKey, format: i32) -> Result<StagingSurface> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: key.width,
            Height: key.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT(format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(capture_error("CreateTexture2D"))?;
        texture
            .map(StagingSurface)
            .ok_or_else(|| Error::Capture("CreateTexture2D returned no texture".into()))
    }

    pub unsafe fn extract(
        extractor: &mut FrameExtractor,
        swap_chain: *mut c_void,
    ) -> Result<framelink_common::FrameData> {
        let swap_chain = IDXGISwapChain::from_raw_borrowed(&swap_chain)
            .ok_or(Error::InvalidAddress(0))?;
        let back_buffer: ID3D11Texture2D = swap_chain.GetBuffer(0).map_err(capture_error("GetBuffer"))?;
        let device: ID3D11Device = swap_chain
            .GetDevice()
            .map_err(capture_error("GetDevice"))?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        back_buffer.GetDesc(&mut desc);
        if desc.SampleDesc.Count > 1 {
            return Err(Error::Capture(format!(
                "multisampled back buffer ({}x) is not supported",
                desc.SampleDesc.Count
            )));
        }

        let key = StagingKey {
            width: desc.Width,
            height: desc.Height,
            format: PixelFormat(desc.Format.0 as u32),
            device: device.as_raw() as usize,
        };
        let staging = extractor
            .staging
            .ensure(key, |key| create_staging(&device, key, desc.Format.0))?
            .0
            .clone();

        let context = device
            .GetImmediateContext()
            .map_err(capture_error("GetImmediateContext"))?;
        context.CopyResource(&staging, &back_buffer);

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        context
            .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            .map_err(capture_error("Map"))?;

        let len = desc.Height as usize * mapped.RowPitch as usize;
        let result = if mapped.pData.is_null() {
            Err(Error::Capture("Map returned a null pointer".into()))
        } else {
            let bytes = std::slice::from_raw_parts(mapped.pData as *const u8, len);
            extractor.package(bytes, mapped.RowPitch, desc.Width, desc.Height, key.format)
        };
        context.Unmap(&staging, 0);
        result
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    use super::FrameExtractor;
    use framelink_common::{Error, FrameData, Result};
    use std::ffi::c_void;

    pub type StagingSurface = ();

    pub unsafe fn extract(_extractor: &mut FrameExtractor, _swap_chain: *mut c_void) -> Result<FrameData> {
        Err(Error::NotImplemented(
            "back-buffer capture requires Direct3D 11".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;
    use parking_lot::Mutex;

    fn key(width: u32, height: u32) -> StagingKey {
        StagingKey {
            width,
            height,
            format: PixelFormat::B8G8R8A8_UNORM,
            device: 1,
        }
    }

    #[test]
    fn test_staging_reused_until_key_changes() {
        let mut cache: StagingCache<u32> = StagingCache::default();
        let mut created = 0;
        for _ in 0..3 {
            cache
                .ensure(key(640, 480), |_| {
                    created += 1;
                    Ok(created)
                })
                .unwrap();
        }
        assert_eq!(created, 1);

        let surface = *cache.ensure(key(800, 600), |_| Ok(99)).unwrap();
        assert_eq!(surface, 99);
        assert_eq!(cache.allocations(), 2);
    }

    #[test]
    fn test_staging_kept_when_recreate_fails() {
        let mut cache: StagingCache<u32> = StagingCache::default();
        cache.ensure(key(640, 480), |_| Ok(7)).unwrap();

        let err = cache.ensure(key(1024, 768), |_| Err(Error::Capture("out of memory".into())));
        assert!(err.is_err());
        assert_eq!(cache.key(), Some(key(640, 480)));
        assert_eq!(*cache.ensure(key(640, 480), |_| Ok(0)).unwrap(), 7);
        assert_eq!(cache.allocations(), 1);
    }

    #[test]
    fn test_package_copies_height_times_pitch() {
        let mut extractor = FrameExtractor::new(Arc::new(CallbackRegistry::new()));
        // 3x2 image with 16-byte pitch, plus trailing bytes past the image
        let mapped: Vec<u8> = (0..40).collect();

        let first = extractor
            .package(&mapped, 16, 3, 2, PixelFormat::B8G8R8A8_UNORM)
            .unwrap();
        assert_eq!(first.data, (0..32).collect::<Vec<u8>>());
        assert_eq!(first.stride, 16);
        assert_eq!(first.sequence, 0);
        assert!(first.timestamp > 0);

        let second = extractor
            .package(&mapped, 16, 3, 2, PixelFormat::B8G8R8A8_UNORM)
            .unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(extractor.stats().captured, 2);
    }

    #[test]
    fn test_package_rejects_short_mapping() {
        let mut extractor = FrameExtractor::new(Arc::new(CallbackRegistry::new()));
        assert!(matches!(
            extractor.package(&[0; 10], 16, 3, 2, PixelFormat::B8G8R8A8_UNORM),
            Err(Error::Capture(_))
        ));
        assert_eq!(extractor.stats().captured, 0);
    }

    #[test]
    fn test_deliver_reaches_callback_and_transport() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        callbacks.register(Arc::new(move |pixels: &[u8], w, h| {
            sink.lock().push((pixels.len(), w, h));
        }));

        let name = format!("extractor-deliver-{}", std::process::id());
        let transport = Arc::new(
            SharedMemoryRingTransport::create_or_open(
                TransportOptions::new(name).slot_count(2).max_frame_bytes(64),
            )
            .unwrap(),
        );
        let mut extractor = FrameExtractor::new(callbacks).with_transport(transport.clone());

        let small = extractor
            .package(&[5; 32], 16, 4, 2, PixelFormat::B8G8R8A8_UNORM)
            .unwrap();
        extractor.deliver(&small);

        // Too big for the ring; the callback still sees it
        let big = extractor
            .package(&[6; 128], 32, 8, 4, PixelFormat::B8G8R8A8_UNORM)
            .unwrap();
        extractor.deliver(&big);

        assert_eq!(*seen.lock(), vec![(32, 4, 2), (128, 8, 4)]);
        assert_eq!(transport.pending(), 1);
        assert_eq!(extractor.stats().transport_errors, 1);
    }

    #[test]
    fn test_null_swap_chain_skipped() {
        let mut extractor = FrameExtractor::new(Arc::new(CallbackRegistry::new()));
        assert!(unsafe { extractor.extract(std::ptr::null_mut()) }.is_err());
        unsafe { extractor.on_present(std::ptr::null_mut()) };
        assert_eq!(extractor.stats().failed, 1);
        assert_eq!(extractor.stats().presents, 1);
    }

    #[test]
    fn test_frame_interval_skips_presents() {
        let mut extractor =
            FrameExtractor::new(Arc::new(CallbackRegistry::new())).with_frame_interval(3);
        for _ in 0..7 {
            unsafe { extractor.on_present(std::ptr::null_mut()) };
        }
        // Attempts on presents 1, 4 and 7
        assert_eq!(extractor.stats().failed, 3);
        assert_eq!(extractor.stats().presents, 7);
    }
}
