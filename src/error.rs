use thiserror::Error;

/// Errors surfaced by pipeline construction and the decode front end.
///
/// Per-chunk numeric paths never return errors: every division in the DSP
/// code floor-clamps its denominator, and silence is a detected state, not a
/// failure. Buffer storage is owned fixed arrays, so there is no recoverable
/// allocation path; an out-of-memory startup aborts through the allocator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A caller handed an unusable parameter (wrong chunk length, zero-sized
    /// window, malformed time signature).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The decode front end could not open or parse the input stream.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Sample-rate conversion to the pipeline rate failed.
    #[error("resample failed: {0}")]
    Resample(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
