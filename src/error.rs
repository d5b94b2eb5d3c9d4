//! Error types for decoding, page sources and the extraction entry points.

use thiserror::Error;

use crate::decoder::PixelKind;

/// Failure to decode a single packed pixel buffer.
///
/// Fatal to the one image it was raised for; the collector logs it and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad image kind: {0}")]
    UnsupportedPixelKind(u8),

    #[error(
        "malformed {kind:?} record {width}x{height}: need {expected} bytes, got {actual}"
    )]
    MalformedRecord {
        kind: PixelKind,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("image {width}x{height} is too large to decode")]
    ImageTooLarge { width: u32, height: u32 },
}

/// Failure reported by a document or page handle.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("page index {index} out of range (document has {count} pages)")]
    PageOutOfRange { index: usize, count: usize },

    #[error("failed to materialize page {page}: {reason}")]
    Materialization { page: usize, reason: String },
}

/// Error type for the top-level extraction operations.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Quality must be between 1 and 100")]
    InvalidQuality,

    #[error("Failed to load PDF: {0}")]
    LoadError(String),

    #[error("Failed to save image: {0}")]
    SaveError(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),
}

impl From<SourceError> for ExtractError {
    fn from(error: SourceError) -> Self {
        ExtractError::LoadError(error.to_string())
    }
}
