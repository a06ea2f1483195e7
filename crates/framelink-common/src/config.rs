//! Pipeline configuration
//!
//! Loaded from `framelink.toml`. Every field has a default, so an empty or
//! missing file yields a working setup.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::types::CompressionType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name looked up next to the host executable
pub const CONFIG_FILE_NAME: &str = "framelink.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Shared-memory ring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Export frames through shared memory
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name of the shared segment; the event name is derived from it
    #[serde(default = "default_segment_name")]
    pub name: String,
    /// Number of frames the ring retains
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Largest encoded payload one slot can hold
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Requested payload encoding
    #[serde(default)]
    pub compression: CompressionType,
}

/// Capture and discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Copy back buffers on each present
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Create a throwaway swap chain at startup to find the present slot
    #[serde(default = "default_true")]
    pub discover_on_start: bool,
    /// Intercept factory and device creation to catch later swap chains
    #[serde(default = "default_true")]
    pub hook_factories: bool,
    /// Fall back to the signature table when an export cannot be resolved
    #[serde(default = "default_true")]
    pub use_signatures: bool,
    /// Capture every Nth present; 1 captures all
    #[serde(default = "default_frame_interval")]
    pub frame_interval: u32,
}

fn default_true() -> bool {
    true
}

fn default_segment_name() -> String {
    "FramelinkFrames".to_string()
}

fn default_slot_count() -> u32 {
    4
}

fn default_max_frame_bytes() -> u32 {
    1920 * 1080 * 4
}

fn default_frame_interval() -> u32 {
    1
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_segment_name(),
            slot_count: default_slot_count(),
            max_frame_bytes: default_max_frame_bytes(),
            compression: CompressionType::None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discover_on_start: true,
            hook_factories: true,
            use_signatures: true,
            frame_interval: default_frame_interval(),
        }
    }
}

impl TransportConfig {
    /// Name of the frame-available event paired with the segment
    pub fn event_name(&self) -> String {
        format!("{}Event", self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("transport.name must not be empty".into()));
        }
        if self.slot_count == 0 {
            return Err(Error::Config("transport.slot_count must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config(
                "transport.max_frame_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load `framelink.toml` from `dir`, falling back to defaults when absent
    pub fn load_from_dir_or_default(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.capture.frame_interval == 0 {
            return Err(Error::Config("capture.frame_interval must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.transport.enabled);
        assert_eq!(config.transport.slot_count, 4);
        assert_eq!(config.transport.max_frame_bytes, 1920 * 1080 * 4);
        assert_eq!(config.transport.compression, CompressionType::None);
        assert!(config.capture.discover_on_start);
        assert_eq!(config.capture.frame_interval, 1);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [transport]
            name = "Custom"
            compression = "rle"

            [capture]
            hook_factories = false

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.name, "Custom");
        assert_eq!(config.transport.event_name(), "CustomEvent");
        assert_eq!(config.transport.compression, CompressionType::Rle);
        assert_eq!(config.transport.slot_count, 4);
        assert!(!config.capture.hook_factories);
        assert!(config.capture.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_zero_slots_rejected() {
        let err = PipelineConfig::from_toml_str("[transport]\nslot_count = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_toml_rejected() {
        assert!(PipelineConfig::from_toml_str("[transport\n").is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("framelink-cfg-{}", std::process::id()));
        let config = PipelineConfig::load_from_dir_or_default(&dir).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }
}
