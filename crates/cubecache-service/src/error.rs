use thiserror::Error;

use crate::types::{RegionId, SourceId};

/// An error surfaced by the engine to the immediate caller of an operation.
///
/// Errors never poison the caches: no aggregate that was produced alongside an error is ever
/// marked as complete. Staleness and cancellation are not errors; see
/// [`CancelReason`](crate::cancellation::CancelReason).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CubeError {
    /// The source could not be opened or read, or it changed in the middle of a read.
    #[error("i/o error: {0}")]
    Io(String),
    /// The source or region has a dimensionality outside of the supported 2D to 4D range.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),
    /// A slice or plane range lies outside of the source.
    #[error("invalid range: {0}")]
    InvalidRange(String),
    /// A channel plane was read before the plane cache was ever filled.
    #[error("channel plane cache was never filled")]
    NotFilled,
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("unknown region {0}")]
    UnknownRegion(RegionId),
    /// The session is shutting down and does not accept new work.
    #[error("shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for CubeError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CubeError {
    /// Logs the given error and converts it into an [`Io`](Self::Io) error.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Io(e.to_string())
    }

    /// A short tag used in metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::UnsupportedShape(_) => "unsupported_shape",
            Self::InvalidRange(_) => "invalid_range",
            Self::NotFilled => "not_filled",
            Self::UnknownSource(_) => "unknown_source",
            Self::UnknownRegion(_) => "unknown_region",
            Self::ShuttingDown => "shutting_down",
        }
    }
}
