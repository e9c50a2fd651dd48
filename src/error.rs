//! Error types for the acceptance harness.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single image that could not be removed during a cleanup sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// The fixture label the image was registered under.
    pub label: String,
    /// The image reference that failed to be removed.
    pub image: String,
    /// Why removal failed.
    pub reason: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.image, self.label, self.reason)
    }
}

/// Top-level error type for harness operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An image engine primitive (build, push, remove, info) failed.
    #[error("docker {action} failed for {image}: {reason}")]
    Engine {
        action: &'static str,
        image: String,
        reason: String,
    },

    /// Compiling or copying the phase binary failed.
    #[error("failed to compile lifecycle: {0}")]
    Compile(String),

    /// The ephemeral registry could not be started, stopped or queried.
    #[error("registry error: {0}")]
    Registry(String),

    /// A registry-dependent operation was used on a phase test without a registry.
    #[error("phase test has no active registry target")]
    RegistryNotActive,

    /// One or more images could not be removed during a cleanup sweep.
    #[error("{} image(s) failed to be removed, first: {}", .failures.len(), first_failure(.failures))]
    Cleanup { failures: Vec<CleanupFailure> },

    /// A fixture file could not be read.
    #[error("failed to read fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        source: std::io::Error,
    },

    /// IO error during filesystem operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Harness configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

fn first_failure(failures: &[CleanupFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, Error>;
