//! Error types for the audio pipeline.
//!
//! Only [`AudioError::DeviceUnavailable`] is meant to reach the caller as a hard
//! failure. Decode and scheduling errors are contained per chunk.

use thiserror::Error;

/// Errors raised while turning a text token back into PCM samples.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Token contains characters outside both base64 alphabets, or bad padding.
    #[error("Invalid audio token: {0}")]
    InvalidToken(#[from] base64::DecodeError),

    /// Decoded payload cannot be split into 16-bit samples.
    #[error("Odd PCM16 payload length: {0} bytes")]
    OddByteLength(usize),
}

/// Errors that can occur in capture or playback.
#[derive(Error, Debug)]
pub enum AudioError {
    /// Input or output device could not be acquired or resumed.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A chunk could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A playback buffer could not be materialized or scheduled.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// `start` was called on a capture encoder that is already running.
    #[error("Capture already active")]
    CaptureActive,
}

/// Convenience Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
