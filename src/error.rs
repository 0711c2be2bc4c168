//! Error types for vmeforge.

use thiserror::Error;

/// Main error type for control-plane operations.
///
/// Every `encode_frame` call surfaces at most one of these; no partial
/// bitstream is valid on error.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// Structurally inconsistent codec parameters, detected before any
    /// hardware resource is touched. The frame is rejected; not retried.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying buffer or surface allocation failed. The frame is
    /// rejected; partially-allocated per-surface state is left "not ready"
    /// and is re-attempted on the next ensure call for that surface.
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    /// Command-queue submission failed. Fatal for the frame; the session
    /// remains usable for subsequent frames.
    #[error("Hardware submission failed: {0}")]
    SubmissionFailure(String),

    /// A kernel parameter-block region or status buffer could not be
    /// mapped. The builder aborts and the stage is skipped; fatal for the
    /// frame, not retried.
    #[error("Failed to map {0}")]
    MapFailure(String),
}

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, EncodeError>;
