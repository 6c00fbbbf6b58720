use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the analysis core.
///
/// None of these is fatal to the process. A `MalformedPayload` or
/// `InvalidShape` means the capture cannot be analysed; every other
/// variant leaves the in-memory session usable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed thermal payload: expected {expected} bytes, found {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    #[error("{width}x{height} is not a valid shape for {samples} samples")]
    InvalidShape {
        width: usize,
        height: usize,
        samples: usize,
    },

    #[error("unsupported sample width: {0} bytes (expected 1 or 2)")]
    UnsupportedSampleWidth(usize),

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("no ROI with id {0}")]
    UnknownRoi(Uuid),

    #[error("an ROI with id {0} already exists")]
    DuplicateRoi(Uuid),

    #[error("session file '{path}': {source}")]
    Persistence {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("could not read capture: {0}")]
    Capture(String),
}

impl Error {
    pub(crate) fn persistence<E>(path: impl Into<PathBuf>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
