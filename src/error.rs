//! Error types shared by all processing stages.
//!
//! Configuration problems are detected before any volume data is touched, I/O
//! problems always carry the offending path and numerical problems describe the
//! operation that could not be carried out.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type of the crate.
#[derive(Error, Debug)]
pub enum RsError {
    /// A required parameter is missing or parameters contradict each other.
    #[error("invalid configuration ({field}): {message}")]
    Configuration { field: String, message: String },

    /// A file could not be read or written.
    #[error("{message}: {}", path.display())]
    Io { path: PathBuf, message: String },

    /// A NIfTI volume could not be read or written.
    #[error("volume i/o failed for {}: {source}", path.display())]
    VolumeIo {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    /// A text table could not be parsed.
    #[error("could not parse {} (line {line}): {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Two inputs that must agree in size do not.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A computation is not defined for the given input.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// The worker pool could not be created.
    #[error(transparent)]
    Pool(#[from] frame_loops::PoolError),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, RsError>;

impl RsError {
    #[must_use]
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn io(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn volume_io(path: impl AsRef<Path>, source: nifti::NiftiError) -> Self {
        Self::VolumeIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn parse(path: impl AsRef<Path>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.as_ref().to_path_buf(),
            line,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn dimension_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    #[must_use]
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }
}
