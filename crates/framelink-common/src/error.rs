//! Error types for framelink

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(usize),

    #[error("Protection change refused at {address:#x}: {message}")]
    Protection { address: usize, message: String },

    #[error("Hook installation failed: {0}")]
    HookInstall(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Frame too large for slot: {required} > {capacity}")]
    FrameTooLarge { required: usize, capacity: usize },

    #[error("Shared memory header mismatch: {0}")]
    HeaderMismatch(String),

    #[error("Compression type not supported by this segment: {0}")]
    CompressionUnsupported(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// Discovery failures leave the pipeline running with reduced reach.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Error::PatternNotFound(_) | Error::ModuleNotFound(_) | Error::ExportNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_error_display() {
        let err = Error::Protection {
            address: 0x140001000,
            message: "Access denied".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x140001000"));
        assert!(msg.contains("Access denied"));
    }

    #[test]
    fn test_invalid_address_error_display() {
        let err = Error::InvalidAddress(0xDEADBEEF);
        let msg = format!("{}", err);
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = Error::FrameTooLarge {
            required: 9000,
            capacity: 4096,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("9000"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_module_not_found_error_display() {
        let err = Error::ModuleNotFound("dxgi.dll".to_string());
        assert!(format!("{}", err).contains("dxgi.dll"));
    }

    #[test]
    fn test_is_discovery() {
        assert!(Error::PatternNotFound("Present".into()).is_discovery());
        assert!(Error::ExportNotFound("CreateDXGIFactory".into()).is_discovery());
        assert!(!Error::Capture("map failed".into()).is_discovery());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= nope").unwrap_err();
        let err: Error = toml_err.into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }
        fn returns_err() -> Result<i32> {
            Err(Error::Internal("test".to_string()))
        }
        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
