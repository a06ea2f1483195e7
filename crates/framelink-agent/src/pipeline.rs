//! Wiring of the capture pipeline inside the host

use framelink_common::{CaptureConfig, Error, PipelineConfig, Result};
use framelink_core::hook_set::{self, HookSet};
use framelink_core::{
    CallbackRegistry, ExtractorStats, FactoryInterceptor, FrameExtractor, PresentCallback,
    PresentationHook, SharedMemoryRingTransport, SharedPresentationHook, TransportOptions,
    VTableHookEngine,
};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Present hook, factory interception, extractor and transport of one host
pub struct Pipeline {
    present: SharedPresentationHook,
    interceptor: Option<FactoryInterceptor>,
    extractor: Arc<Mutex<FrameExtractor>>,
    transport: Option<Arc<SharedMemoryRingTransport>>,
}

impl Pipeline {
    /// Build the pipeline and install its hooks. Only a refused factory
    /// interceptor is an error; missing discovery or transport degrade.
    pub fn start(config: &PipelineConfig, callbacks: Arc<CallbackRegistry>) -> Result<Self> {
        let transport = if config.transport.enabled {
            match SharedMemoryRingTransport::create_or_open(TransportOptions::from_config(
                &config.transport,
            )) {
                Ok(transport) => Some(Arc::new(transport)),
                Err(e) => {
                    error!(
                        target: "framelink_agent::pipeline",
                        name = %config.transport.name,
                        error = %e,
                        "Frame ring unavailable, frames go to callbacks only"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut extractor =
            FrameExtractor::new(callbacks).with_frame_interval(config.capture.frame_interval);
        if let Some(transport) = &transport {
            extractor = extractor.with_transport(transport.clone());
        }
        let extractor = Arc::new(Mutex::new(extractor));

        let engine = Arc::new(VTableHookEngine::new());
        let present = Arc::new(Mutex::new(
            PresentationHook::new(engine.clone()).with_callback(present_callback(&extractor)),
        ));

        let mut pipeline = Self {
            present,
            interceptor: None,
            extractor,
            transport,
        };

        if config.capture.enabled {
            pipeline.install(engine, &config.capture)?;
        } else {
            info!(target: "framelink_agent::pipeline", "Capture disabled by configuration");
        }
        Ok(pipeline)
    }

    fn install(&mut self, engine: Arc<VTableHookEngine>, capture: &CaptureConfig) -> Result<()> {
        // Discovery runs before the factory hooks so the probe swap chain
        // it creates is not reported back through them
        if capture.discover_on_start {
            if let Err(e) = self.present.lock().install_hooks() {
                warn!(
                    target: "framelink_agent::pipeline",
                    error = %e,
                    "No swap chain discovered at startup, waiting for one to be created"
                );
            }
        }

        if capture.hook_factories {
            let mut interceptor = FactoryInterceptor::new(engine, self.present.clone())
                .with_signatures(capture.use_signatures);
            interceptor.install_hooks()?;
            self.interceptor = Some(interceptor);
        }

        info!(
            target: "framelink_agent::pipeline",
            present_hooked = self.present.lock().is_installed(),
            factory_hooks = self.interceptor.as_ref().map(|i| i.hooked_exports()).unwrap_or(0),
            transport = self.transport.is_some(),
            "Capture pipeline installed"
        );
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.present.lock().is_installed()
    }

    pub fn extractor_stats(&self) -> ExtractorStats {
        self.extractor.lock().stats()
    }

    pub fn transport(&self) -> Option<&Arc<SharedMemoryRingTransport>> {
        self.transport.as_ref()
    }

    /// Remove every hook, then release the staging surface and the ring
    pub fn shutdown(&mut self) -> Result<()> {
        let failures = {
            let mut present = self.present.lock();
            let mut sets: Vec<&mut dyn HookSet> = vec![&mut *present];
            if let Some(interceptor) = self.interceptor.as_mut() {
                sets.push(interceptor);
            }
            hook_set::remove_all(&mut sets)
        };
        self.interceptor = None;
        self.extractor.lock().reset();

        if let Some(transport) = self.transport.take() {
            debug!(
                target: "framelink_agent::pipeline",
                stats = ?transport.stats(),
                "Releasing frame ring"
            );
        }

        match failures.first() {
            None => Ok(()),
            Some((name, e)) => Err(Error::HookInstall(format!(
                "{} hook set not removed: {}",
                name, e
            ))),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "framelink_agent::pipeline", error = %e, "Pipeline shutdown incomplete");
        }
    }
}

/// Present callback feeding the extractor. A present arriving while the
/// previous capture is still running is skipped rather than queued.
fn present_callback(extractor: &Arc<Mutex<FrameExtractor>>) -> PresentCallback {
    let extractor = extractor.clone();
    Arc::new(move |swap_chain: *mut c_void| {
        if let Some(mut extractor) = extractor.try_lock() {
            // SAFETY: called from the present thunk with the live swap chain.
            unsafe { extractor.on_present(swap_chain) };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_common::TransportConfig;

    fn config(name: &str) -> PipelineConfig {
        PipelineConfig {
            transport: TransportConfig {
                name: format!("{}-{}", name, std::process::id()),
                slot_count: 2,
                max_frame_bytes: 4096,
                ..Default::default()
            },
            capture: CaptureConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_start_without_capture_creates_ring() {
        let mut pipeline =
            Pipeline::start(&config("pipeline-ring"), Arc::new(CallbackRegistry::new())).unwrap();
        assert!(!pipeline.is_capturing());
        let transport = pipeline.transport().unwrap();
        assert!(transport.is_creator());
        assert_eq!(transport.capacity(), 2);

        pipeline.shutdown().unwrap();
        assert!(pipeline.transport().is_none());
    }

    #[test]
    fn test_transport_disabled() {
        let mut config = config("pipeline-off");
        config.transport.enabled = false;
        let pipeline = Pipeline::start(&config, Arc::new(CallbackRegistry::new())).unwrap();
        assert!(pipeline.transport().is_none());
        assert_eq!(pipeline.extractor_stats(), ExtractorStats::default());
    }

    #[test]
    fn test_present_callback_counts_presents() {
        let extractor = Arc::new(Mutex::new(FrameExtractor::new(Arc::new(
            CallbackRegistry::new(),
        ))));
        let callback = present_callback(&extractor);
        callback(std::ptr::null_mut());
        callback(std::ptr::null_mut());

        let stats = extractor.lock().stats();
        assert_eq!(stats.presents, 2);
        assert_eq!(stats.failed, 2);

        // Busy extractor: the present passes through untouched
        let guard = extractor.lock();
        callback(std::ptr::null_mut());
        assert_eq!(guard.stats().presents, 2);
    }
}
