//! cpal output device with a sample-accurate clock.
//!
//! The device clock is the number of frames the output callback has rendered,
//! so it only advances while the stream is running. Scheduled buffers travel
//! to the callback through a lock-free ring buffer; the callback renders each
//! one from its start frame and reports completion through the session queue
//! a couple of blocks before the buffer's last frame, which leaves the session
//! time to place the successor at exactly that frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use tracing::{debug, info, warn};

use super::resampler::resample;
use super::scheduler::{ChunkId, OutputDevice, PlaybackBuffer};
use super::session::CompletionNotifier;
use super::util::{find_best_config, get_device_name};
use crate::error::{AudioError, AudioResult};

/// Buffers in flight between scheduler and callback. Playback is sequential,
/// so only a handful are ever pending.
const SCHEDULE_RING_SIZE: usize = 16;

/// Completion is reported once a buffer's last frame falls within this many
/// callback blocks, so its successor is already in the ring when it ends.
const LOOKAHEAD_BLOCKS: u64 = 2;

/// A buffer placed on the device timeline.
struct Scheduled {
    id: ChunkId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Scheduled {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// The buffer being rendered and whether its completion went out already.
struct Playing {
    item: Scheduled,
    notified: bool,
}

/// Renders scheduled buffers into interleaved output frames.
struct Renderer {
    current: Option<Playing>,
}

impl Renderer {
    /// Fill `data` starting at device frame `position`, pulling new buffers via `next`.
    /// Returns the position after the block.
    ///
    /// `on_finished` fires exactly once per buffer, as soon as its end is within
    /// [`LOOKAHEAD_BLOCKS`] blocks of this block's start. A successor scheduled
    /// at that end frame then plays without a gap.
    fn render(
        &mut self,
        data: &mut [f32],
        channels: usize,
        position: u64,
        mut next: impl FnMut() -> Option<Scheduled>,
        mut on_finished: impl FnMut(ChunkId),
    ) -> u64 {
        let channels = channels.max(1);
        let block_frames = (data.len() / channels) as u64;
        let horizon = position + LOOKAHEAD_BLOCKS * block_frames;
        let mut position = position;

        for frame in data.chunks_mut(channels) {
            if self.current.is_none() {
                // A buffer that arrives after its start frame plays late, never truncated
                self.current = next().map(|mut item| {
                    item.start_frame = item.start_frame.max(position);
                    Playing { item, notified: false }
                });
            }

            let mut sample = 0.0;
            let mut done = false;
            if let Some(playing) = self.current.as_mut() {
                if !playing.notified && playing.item.end_frame() <= horizon {
                    playing.notified = true;
                    on_finished(playing.item.id);
                }
                if position >= playing.item.start_frame {
                    let offset = (position - playing.item.start_frame) as usize;
                    sample = playing.item.samples.get(offset).copied().unwrap_or(0.0);
                    done = offset + 1 >= playing.item.samples.len();
                }
            }
            if done
                && let Some(playing) = self.current.take()
                && !playing.notified
            {
                on_finished(playing.item.id);
            }

            for channel in frame.iter_mut() {
                *channel = sample;
            }
            position += 1;
        }
        position
    }
}

/// Default output device of the default cpal host.
pub struct CpalOutput {
    stream: Stream,
    device_sample_rate: u32,
    producer: ringbuf::HeapProd<Scheduled>,
    frames_rendered: Arc<AtomicU64>,
    suspended: bool,
    closed: bool,
}

impl CpalOutput {
    /// Open the default output device, preferring `sample_rate`.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`] if no usable output device exists
    /// or the stream cannot be built or started.
    pub fn open(sample_rate: u32, notifier: CompletionNotifier) -> AudioResult<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| AudioError::DeviceUnavailable("No output device available".to_string()))?;

        info!("Using output device: {}", get_device_name(&device));

        let supported_configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to get supported output configs: {}", e)))?;
        let config = find_best_config(supported_configs, sample_rate)?;
        let device_sample_rate = config.sample_rate();
        let channels = config.channels() as usize;

        if device_sample_rate != sample_rate {
            info!("Device sample rate {} Hz differs from input {} Hz - resampling will be applied", device_sample_rate, sample_rate);
        }
        debug!("Audio playback config: {} Hz, {} channels, {:?}", device_sample_rate, channels, config.sample_format());

        let ring = HeapRb::<Scheduled>::new(SCHEDULE_RING_SIZE);
        let (producer, mut consumer) = ring.split();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let frames_clone = frames_rendered.clone();
        let mut renderer = Renderer { current: None };

        let stream_config: StreamConfig = config.config();
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let position = frames_clone.load(Ordering::Acquire);
                    let end = renderer.render(data, channels, position, || consumer.try_pop(), |id| notifier.finished(id));
                    frames_clone.store(end, Ordering::Release);
                },
                |err| tracing::error!("Audio playback error: {}", err),
                None,
            )
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to build output stream: {}", e)))?;

        stream.play().map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start playback stream: {}", e)))?;

        info!("Audio playback configured: input {} Hz -> device {} Hz", sample_rate, device_sample_rate);

        Ok(Self { stream, device_sample_rate, producer, frames_rendered, suspended: false, closed: false })
    }

    pub fn device_sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    /// Pause the stream; the clock stops until [`OutputDevice::resume`].
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`] if the stream cannot be paused.
    pub fn suspend(&mut self) -> AudioResult<()> {
        if !self.suspended {
            self.stream.pause().map_err(|e| AudioError::DeviceUnavailable(format!("Failed to pause playback stream: {}", e)))?;
            self.suspended = true;
            debug!("Output device suspended");
        }
        Ok(())
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_sample_rate as f64
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn resume(&mut self) -> AudioResult<()> {
        if self.closed {
            return Err(AudioError::DeviceUnavailable("Output device closed".to_string()));
        }
        if self.suspended {
            self.stream.play().map_err(|e| AudioError::DeviceUnavailable(format!("Failed to resume playback stream: {}", e)))?;
            self.suspended = false;
        }
        Ok(())
    }

    fn start_buffer(&mut self, buffer: PlaybackBuffer, start_at: f64) -> AudioResult<()> {
        if self.closed {
            return Err(AudioError::Scheduling("Output device closed".to_string()));
        }

        let samples = if buffer.sample_rate != self.device_sample_rate {
            resample(&buffer.samples, buffer.sample_rate, self.device_sample_rate).map_err(|e| AudioError::Scheduling(e.to_string()))?
        } else {
            buffer.samples
        };
        if samples.is_empty() {
            return Err(AudioError::Scheduling(format!("Chunk {} is empty at {} Hz", buffer.id, self.device_sample_rate)));
        }

        let start_frame = (start_at * self.device_sample_rate as f64).round() as u64;
        self.producer
            .try_push(Scheduled { id: buffer.id, start_frame, samples })
            .map_err(|_| AudioError::Scheduling("Playback schedule ring full".to_string()))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.stream.pause() {
            warn!("Failed to pause playback stream on close: {}", e);
        }
        self.closed = true;
        self.suspended = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scheduled(id: ChunkId, start_frame: u64, samples: Vec<f32>) -> Scheduled {
        Scheduled { id, start_frame, samples }
    }

    #[test]
    fn test_successor_scheduled_on_completion_plays_without_gap() {
        // Drives the renderer the way the session does: the next chunk is only
        // handed over after the previous one reports completion, at
        // max(clock, next_start), with the clock read after the block.
        const BLOCK: usize = 8;
        let mut waiting: VecDeque<Vec<f32>> = VecDeque::from(vec![vec![0.1; 20], vec![0.2; 20], vec![0.3; 20]]);
        let mut ring = VecDeque::new();
        let mut renderer = Renderer { current: None };
        let mut output = Vec::new();
        let mut clock = 0u64;
        let mut next_start = 0u64;
        let mut next_id: ChunkId = 1;

        let mut schedule = |ring: &mut VecDeque<Scheduled>, waiting: &mut VecDeque<Vec<f32>>, clock: u64, next_start: &mut u64| {
            if let Some(samples) = waiting.pop_front() {
                let start = clock.max(*next_start);
                *next_start = start + samples.len() as u64;
                ring.push_back(scheduled(next_id, start, samples));
                next_id += 1;
            }
        };
        schedule(&mut ring, &mut waiting, clock, &mut next_start);

        for _ in 0..9 {
            let mut block = vec![0.0f32; BLOCK];
            let mut finished = Vec::new();
            clock = renderer.render(&mut block, 1, clock, || ring.pop_front(), |id| finished.push(id));
            output.extend_from_slice(&block);
            for _ in finished {
                schedule(&mut ring, &mut waiting, clock, &mut next_start);
            }
        }

        let mut expected = vec![0.1; 20];
        expected.extend_from_slice(&[0.2; 20]);
        expected.extend_from_slice(&[0.3; 20]);
        assert_eq!(&output[..60], &expected[..]);
        assert!(output[60..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_waits_for_future_start_and_duplicates_channels() {
        let mut pending = VecDeque::from(vec![scheduled(7, 12, vec![0.5])]);
        let mut finished = Vec::new();
        let mut renderer = Renderer { current: None };
        let mut data = vec![1.0f32; 6];

        let end = renderer.render(&mut data, 2, 10, || pending.pop_front(), |id| finished.push(id));

        assert_eq!(end, 13);
        assert_eq!(data, vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.5]);
        assert_eq!(finished, vec![7]);
    }

    #[test]
    fn test_late_buffer_plays_in_full() {
        let mut pending = VecDeque::from(vec![scheduled(3, 2, vec![0.1, 0.2])]);
        let mut finished = Vec::new();
        let mut renderer = Renderer { current: None };
        let mut data = vec![0.0f32; 3];

        renderer.render(&mut data, 1, 5, || pending.pop_front(), |id| finished.push(id));

        assert_eq!(data, vec![0.1, 0.2, 0.0]);
        assert_eq!(finished, vec![3]);
    }

    #[test]
    fn test_completion_reported_once_ahead_of_end() {
        let mut pending = VecDeque::from(vec![scheduled(4, 0, vec![0.25; 10])]);
        let mut finished = Vec::new();
        let mut renderer = Renderer { current: None };
        let mut output = Vec::new();
        let mut position = 0;

        for expect_finished in [false, false, true, true] {
            let mut block = vec![0.0f32; 3];
            position = renderer.render(&mut block, 1, position, || pending.pop_front(), |id| finished.push(id));
            output.extend_from_slice(&block);
            assert_eq!(!finished.is_empty(), expect_finished);
        }

        // Reported in the block starting at frame 6, while frames 6..10 still play
        assert_eq!(finished, vec![4]);
        assert_eq!(&output[..10], &[0.25; 10]);
        assert_eq!(&output[10..], &[0.0, 0.0]);
    }
}
