//! Error types for resource streaming
//!
//! Two layers:
//! - [`LoadError`] is produced by a resource's `load()` or by the storage
//!   source. It never crosses the worker boundary as a panic; the pipeline
//!   turns it into a state change plus a log record.
//! - [`ResourceError`] is returned to callers of the manager API.

use std::io;
use thiserror::Error;

/// Error raised while loading a single resource
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Loader panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Custom(String),
}

/// Result type for resource loading
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors from the resource manager API
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Resource '{key}' is registered with a different type (expected {expected})")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Resource manager '{0}' has been shut down")]
    ShutDown(String),

    #[error("Failed to spawn streaming worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for manager operations
pub type ResourceResult<T> = Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err = LoadError::NotFound("textures/grass.png".into());
        assert_eq!(err.to_string(), "Resource not found: textures/grass.png");

        let err = LoadError::Decode("bad header".into());
        assert_eq!(err.to_string(), "Decode error: bad header");
    }

    #[test]
    fn test_io_error_converts() {
        let io = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: LoadError = io.into();
        assert!(matches!(err, LoadError::Io(_)));
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = ResourceError::TypeMismatch {
            key: "models/tree.mesh".into(),
            expected: "Mesh",
        };
        assert!(err.to_string().contains("models/tree.mesh"));
        assert!(err.to_string().contains("Mesh"));
    }
}
