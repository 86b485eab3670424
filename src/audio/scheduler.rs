//! Gapless playback scheduling of streamed PCM16 chunks.
//!
//! Chunks are decoded on arrival, queued FIFO and played strictly one at a
//! time. Each chunk starts at `max(device_time, next_start_time)`, so a chunk
//! that is already queued when its predecessor finishes butts exactly against
//! it, and nothing is ever scheduled in the past.
//!
//! The scheduler never blocks and never calls back into itself through the
//! device: the device reports completion out of band and the owner forwards it
//! to [`PlaybackScheduler::on_finished`]. See `session` for the event loop.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use super::pcm;
use crate::error::AudioResult;

/// Identifies one submitted chunk for completion reporting.
pub type ChunkId = u64;

/// A decoded chunk materialized for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub id: ChunkId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Duration in seconds at the buffer's own rate.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Audio output with a monotonic clock.
///
/// Implementations report the end of every started buffer exactly once, out of
/// band, so the owner can call [`PlaybackScheduler::on_finished`].
pub trait OutputDevice {
    /// Device time in seconds. Never decreases; stands still while suspended.
    fn current_time(&self) -> f64;

    fn is_suspended(&self) -> bool;

    /// Resume a suspended clock. No-op when running.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`](crate::error::AudioError::DeviceUnavailable) if the device cannot be resumed.
    fn resume(&mut self) -> AudioResult<()>;

    /// Play `buffer` starting at device time `start_at`.
    ///
    /// # Errors
    /// Returns [`AudioError::Scheduling`](crate::error::AudioError::Scheduling) if the buffer cannot be materialized.
    fn start_buffer(&mut self, buffer: PlaybackBuffer, start_at: f64) -> AudioResult<()>;

    /// Stop output and drop anything still scheduled.
    fn close(&mut self);
}

/// Playback settings, one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Rate of incoming PCM16 chunks.
    pub sample_rate: u32,
    /// Queue bound; the oldest queued chunk is dropped on overflow.
    pub max_queued_chunks: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { sample_rate: 24000, max_queued_chunks: 512 }
    }
}

/// Playback cursor owned by one scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockState {
    /// Device time at which the most recently scheduled chunk ends.
    pub next_start_time: f64,
    /// Chunk currently started but not yet reported finished.
    pub active: Option<ChunkId>,
}

impl ClockState {
    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }
}

/// Counters for status display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub chunks_received: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub decode_failures: u64,
    pub scheduling_failures: u64,
}

#[derive(Debug)]
struct QueuedChunk {
    id: ChunkId,
    samples: Vec<f32>,
}

/// Plays submitted chunks back to back on an [`OutputDevice`].
pub struct PlaybackScheduler<D: OutputDevice> {
    device: D,
    config: PlaybackConfig,
    queue: VecDeque<QueuedChunk>,
    clock: ClockState,
    next_id: ChunkId,
    stats: PlaybackStats,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: D, config: PlaybackConfig) -> Self {
        Self { device, config, queue: VecDeque::new(), clock: ClockState::default(), next_id: 1, stats: PlaybackStats::default() }
    }

    /// Decode a received token and queue it for playback.
    ///
    /// A malformed token is logged and dropped; the queue is left untouched.
    pub fn submit(&mut self, token: &str) -> Option<ChunkId> {
        self.stats.chunks_received += 1;
        match pcm::decode_chunk(token) {
            Ok(samples) => self.submit_samples(samples),
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!("Dropping audio chunk ({} chars): {}", token.len(), e);
                None
            }
        }
    }

    /// Queue already-decoded samples for playback.
    pub fn submit_samples(&mut self, samples: Vec<f32>) -> Option<ChunkId> {
        if samples.is_empty() {
            debug!("Ignoring empty audio chunk");
            return None;
        }

        if self.queue.len() >= self.config.max_queued_chunks.max(1)
            && let Some(oldest) = self.queue.pop_front()
        {
            self.stats.chunks_dropped += 1;
            warn!("Playback queue full ({} chunks), dropped chunk {}", self.config.max_queued_chunks, oldest.id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(QueuedChunk { id, samples });
        self.advance();
        Some(id)
    }

    /// Start the next queued chunk if nothing is playing.
    ///
    /// Safe to call redundantly: does nothing while a chunk is active or the
    /// queue is empty. A chunk that fails to schedule is skipped and the next
    /// one is tried.
    pub fn advance(&mut self) {
        while !self.clock.is_playing() {
            let Some(chunk) = self.queue.pop_front() else {
                return;
            };

            if self.device.is_suspended() {
                warn!("Output device is suspended, attempting resume");
                if let Err(e) = self.device.resume() {
                    warn!("Failed to resume output device: {}", e);
                }
            }

            if let Err(e) = self.schedule(chunk) {
                self.clock.active = None;
                self.stats.scheduling_failures += 1;
                warn!("Failed to schedule audio chunk: {}", e);
            }
        }
    }

    fn schedule(&mut self, chunk: QueuedChunk) -> AudioResult<()> {
        let buffer = PlaybackBuffer { id: chunk.id, samples: chunk.samples, sample_rate: self.config.sample_rate };
        let duration = buffer.duration();
        let start_at = self.device.current_time().max(self.clock.next_start_time);

        self.clock.active = Some(buffer.id);
        self.device.start_buffer(buffer, start_at)?;
        self.clock.next_start_time = start_at + duration;
        self.stats.chunks_played += 1;

        debug!("Scheduled chunk {} at {:.3}s for {:.3}s ({} queued)", chunk.id, start_at, duration, self.queue.len());
        Ok(())
    }

    /// Device reported that chunk `id` finished playing.
    pub fn on_finished(&mut self, id: ChunkId) {
        if self.clock.active != Some(id) {
            debug!("Ignoring completion for inactive chunk {}", id);
            return;
        }
        self.clock.active = None;
        self.advance();
    }

    /// Resume a suspended output device, e.g. after an autoplay block.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`](crate::error::AudioError::DeviceUnavailable) if the device cannot be resumed.
    pub fn resume(&mut self) -> AudioResult<()> {
        if self.device.is_suspended() {
            self.device.resume()?;
            info!("Output device resumed");
        }
        Ok(())
    }

    /// Clear the queue, reset the clock and close the device.
    pub fn release(&mut self) {
        let pending = self.queue.len();
        self.queue.clear();
        self.clock = ClockState::default();
        self.device.close();
        info!("Playback released ({} queued chunks discarded)", pending);
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn clock(&self) -> ClockState {
        self.clock
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn config(&self) -> PlaybackConfig {
        self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}
