//! Error types for the protection pipeline.
//!
//! Failures inside passes are funnelled into run diagnostics by the
//! orchestrator; only fatal conditions (unusable input, configuration
//! cycles, full-debug re-raise) surface as `ProtectionError` to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while loading or emitting a module file.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("module file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read or write module file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed module payload: {0}")]
    Malformed(String),
}

impl CodecError {
    /// True when the underlying cause is a missing input file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Malformed(_) => false,
        }
    }
}

/// A supervised failure raised by a pass. The orchestrator converts these
/// into error diagnostics and keeps going unless debug mode is `Full`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PassError {
    pub message: String,
}

impl PassError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for PassError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for PassError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Fatal or aggregated run errors reported through `ProtectionResult`.
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("input module not found: {0}")]
    InputNotFound(PathBuf),
    #[error("no output path configured")]
    MissingOutputPath,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("pass dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("pass `{id}` failed: {source}")]
    Pass {
        id: String,
        #[source]
        source: PassError,
    },
    #[error("post-condition violated: {0}")]
    PostCondition(String),
    #[error("failed to write output module: {0}")]
    Write(#[source] CodecError),
}

impl ProtectionError {
    /// True when this error is a missing-input-file condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::InputNotFound(_) => true,
            Self::Codec(e) => e.is_not_found(),
            _ => false,
        }
    }
}
