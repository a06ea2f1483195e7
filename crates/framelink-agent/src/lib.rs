//! framelink agent DLL
//!
//! Injected into a Direct3D 11 host. `DllMain` returns at once and a worker
//! thread loads `framelink.toml` from the host executable's directory,
//! starts logging and installs the capture pipeline.
//!
//! # Safety
//! Nothing heavy runs under the loader lock. On detach during process
//! exit the hooks are left alone; the host's threads are already gone.

pub mod ffi;
pub mod pipeline;

use framelink_common::{error, info, init_agent_logging, warn, PipelineConfig};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pipeline::Pipeline;
use std::path::PathBuf;
use std::time::Duration;

static PIPELINE: Lazy<Mutex<Option<Pipeline>>> = Lazy::new(|| Mutex::new(None));

/// Install custom panic handler for crash reporting
fn install_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "framelink_agent::panic",
            message = %payload,
            location = %location,
            "PANIC in framelink-agent"
        );
    }));
}

/// Directory of the host executable, where `framelink.toml` is looked up
fn host_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Worker thread body
fn agent_main() {
    let dir = host_dir();
    let (config, config_error) = match PipelineConfig::load_from_dir_or_default(&dir) {
        Ok(config) => (config, None),
        Err(e) => (PipelineConfig::default(), Some(e)),
    };

    let log_file = init_agent_logging(&config.logging, &dir);
    install_panic_handler();

    info!(
        target: "framelink_agent",
        pid = std::process::id(),
        dir = %dir.display(),
        log_file = ?log_file,
        "Agent thread started"
    );
    if let Some(e) = config_error {
        warn!(target: "framelink_agent", error = %e, "Invalid configuration, using defaults");
    }

    match Pipeline::start(&config, ffi::CALLBACKS.clone()) {
        Ok(pipeline) => *PIPELINE.lock() = Some(pipeline),
        Err(e) => error!(target: "framelink_agent", error = %e, "Pipeline failed to start"),
    }
}

pub(crate) fn with_pipeline<T>(f: impl FnOnce(&Pipeline) -> T) -> Option<T> {
    PIPELINE.lock().as_ref().map(f)
}

/// Tear the pipeline down; `false` when it was not running
pub(crate) fn shutdown_pipeline() -> bool {
    // Bounded so a detach racing a present can never hang the loader
    let Some(mut slot) = PIPELINE.try_lock_for(Duration::from_millis(500)) else {
        return false;
    };
    match slot.take() {
        Some(mut pipeline) => {
            if let Err(e) = pipeline.shutdown() {
                warn!(target: "framelink_agent", error = %e, "Shutdown left hooks behind");
            }
            info!(target: "framelink_agent", "Pipeline stopped");
            true
        }
        None => false,
    }
}

#[cfg(target_os = "windows")]
mod entry {
    use std::ffi::c_void;
    use windows::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    /// DLL entry point
    ///
    /// # Safety
    /// Called by the Windows loader. Must return quickly and not call LoadLibrary.
    #[no_mangle]
    #[allow(non_snake_case)]
    pub unsafe extern "system" fn DllMain(
        _hinst: HINSTANCE,
        reason: u32,
        reserved: *mut c_void,
    ) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => {
                std::thread::spawn(super::agent_main);
            }
            // A null `reserved` means FreeLibrary, not process exit
            DLL_PROCESS_DETACH if reserved.is_null() => {
                super::shutdown_pipeline();
            }
            _ => {}
        }
        TRUE
    }
}
