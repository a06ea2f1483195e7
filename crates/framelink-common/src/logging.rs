//! Logging setup shared by the agent and the reader.
//!
//! The reader logs to stderr. The agent runs inside a host that usually
//! has no console, so it logs to a file next to the host executable.
//! `FRAMELINK_LOG` overrides the configured level with any `EnvFilter`
//! directive string.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding a filter directive
pub const LOG_ENV: &str = "FRAMELINK_LOG";

/// `[logging]` table of `framelink.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    #[serde(default = "default_level")]
    pub level: String,

    /// Write to stderr. Ignored by the agent.
    #[serde(default = "default_true")]
    pub console: bool,

    /// Log file. Relative paths are taken from the host executable's
    /// directory for the agent and from the working directory otherwise.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Include file and line of each event
    #[serde(default)]
    pub source_locations: bool,

    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: true,
            file: None,
            source_locations: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Configured level; unknown names fall back to `info`
    pub fn level(&self) -> Level {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "warning" => Level::WARN,
            other => Level::from_str(other).unwrap_or(Level::INFO),
        }
    }

    /// `FRAMELINK_LOG` when set and valid, the configured level otherwise
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::default().add_directive(self.level().into()))
    }

    /// Settings the agent runs with inside `host_dir`: no console, and a
    /// per-process file unless one is configured
    pub fn for_agent(&self, host_dir: &Path) -> Self {
        let file = match &self.file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => host_dir.join(path),
            None => host_dir.join(format!("framelink-agent-{}.log", std::process::id())),
        };
        Self {
            console: false,
            file: Some(file),
            ansi: false,
            ..self.clone()
        }
    }
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let _ = std::fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Install the global subscriber described by `config`.
///
/// Returns the log file in use. Only the first call in a process installs
/// anything; later calls return `None`.
pub fn init_logging(config: &LogConfig) -> Option<PathBuf> {
    let with_source = config.source_locations;

    let console = config.console.then(|| {
        fmt::layer()
            .with_ansi(config.ansi)
            .with_file(with_source)
            .with_line_number(with_source)
            .with_writer(std::io::stderr)
    });

    let opened = config
        .file
        .as_deref()
        .and_then(|path| open_log_file(path).map(|file| (path.to_path_buf(), file)));
    let (path, file_layer) = match opened {
        Some((path, file)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_file(with_source)
                .with_line_number(with_source)
                .with_writer(Mutex::new(file));
            (Some(path), Some(layer))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(config.filter())
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        path
    } else {
        None
    }
}

/// Logging for the injected agent; see [`LogConfig::for_agent`]
pub fn init_agent_logging(base: &LogConfig, host_dir: &Path) -> Option<PathBuf> {
    init_logging(&base.for_agent(host_dir))
}

/// Stderr logging at the default level for standalone tools
pub fn init_host_logging() {
    init_logging(&LogConfig::default());
}
