use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a compression run.
///
/// Per-image and per-attempt problems never show up here; they are recovered
/// inside the run and reported through [`crate::RecompressSummary`] and
/// [`crate::AttemptSummary`].
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("failed to open document: {0}")]
    DocumentOpen(#[source] lopdf::Error),

    #[error("failed to write document to '{path}': {source}")]
    DocumentWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("compression cancelled before any usable output was produced")]
    Cancelled,

    #[error("output is not smaller than the input ({size} bytes)")]
    NoReduction { size: u64 },
}

impl CompressError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompressError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure to recompress one embedded image. The image is left untouched.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image object {0:?} is not a stream")]
    NotAStream(lopdf::ObjectId),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Reason a candidate file was rejected by the validator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("candidate does not exist")]
    Missing,

    #[error("candidate is only {0} bytes")]
    TooSmall(u64),

    #[error("candidate does not start with the PDF header")]
    BadHeader,

    #[error("candidate cannot be read back: {0}")]
    Unreadable(String),

    #[error("candidate has {found} pages, expected {expected}")]
    PageCountMismatch { expected: usize, found: usize },
}

pub type Result<T, E = CompressError> = std::result::Result<T, E>;
