//! Realtime audio pipeline.
//!
//! Microphone samples are framed and encoded to PCM16 text tokens by
//! [`CaptureEncoder`]; received tokens are decoded and played back gaplessly by
//! a [`PlaybackScheduler`], usually driven through a [`PlaybackSession`].
//! Device I/O uses cpal, with rubato resampling when the hardware rate differs.

mod capture;
pub mod pcm;
mod playback;
pub mod resampler;
pub mod scheduler;
mod session;
pub mod util;

pub use capture::{CaptureConfig, CaptureEncoder, CpalInput, FrameAssembler, InputBackend, InputStream, SampleSink};
pub use playback::CpalOutput;
pub use scheduler::{ChunkId, ClockState, OutputDevice, PlaybackBuffer, PlaybackConfig, PlaybackScheduler, PlaybackStats};
pub use session::{ChunkSubmitter, CompletionNotifier, PlaybackCommand, PlaybackSession, PlaybackStatus};
