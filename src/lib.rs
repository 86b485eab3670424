//! Mission Audio - realtime PCM audio pipeline for voice agents.
//!
//! Captures microphone audio as PCM16 text tokens for a duplex transport and
//! plays streamed PCM16 tokens back gaplessly against the output device clock.

pub mod audio;
pub mod error;

pub use error::{AudioError, AudioResult, DecodeError};
