//! Microphone capture encoder.
//!
//! Pulls mono float samples from an input backend, cuts them into fixed-size
//! frames, encodes each frame as a PCM16 token and hands it to a caller-supplied
//! callback. The device callback only touches a lock-free ring buffer; framing
//! and encoding run on a drain thread and delivery runs on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tracing::{debug, info, warn};

use super::pcm;
use super::resampler::StreamResampler;
use super::util::{downmix_to_mono, find_best_config, get_device_name};
use crate::error::{AudioError, AudioResult};

/// Ring buffer between device callback and drain thread (~4 seconds at 16kHz).
const CAPTURE_RING_SIZE: usize = 65536;

/// Encoded frames buffered ahead of the delivery thread.
const TOKEN_CHANNEL_CAPACITY: usize = 32;

/// Receives mono samples at the requested rate from the device callback.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An opened input stream. Dropping it releases the device.
pub trait InputStream {
    /// Start delivering samples to the sink.
    fn play(&self) -> AudioResult<()>;
}

/// Source of microphone samples.
pub trait InputBackend {
    /// Acquire the input device at `sample_rate` Hz, mono, feeding `sink`.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`] if the device cannot be acquired.
    fn open(&mut self, sample_rate: u32, sink: SampleSink) -> AudioResult<Box<dyn InputStream>>;
}

/// Capture settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Rate of the emitted PCM16 frames.
    pub sample_rate: u32,
    /// Samples per emitted frame.
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { sample_rate: 16000, frame_size: 4096 }
    }
}

/// Default input device of the default cpal host.
#[derive(Debug, Default)]
pub struct CpalInput;

impl InputStream for cpal::Stream {
    fn play(&self) -> AudioResult<()> {
        StreamTrait::play(self).map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start audio stream: {}", e)))
    }
}

impl InputBackend for CpalInput {
    fn open(&mut self, sample_rate: u32, mut sink: SampleSink) -> AudioResult<Box<dyn InputStream>> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| AudioError::DeviceUnavailable("No input device available".to_string()))?;

        info!("Using input device: {}", get_device_name(&device));

        let supported_configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to get supported input configs: {}", e)))?;
        let config = find_best_config(supported_configs, sample_rate)?;
        let device_sample_rate = config.sample_rate();
        let channels = config.channels() as usize;

        let mut resampler = if device_sample_rate != sample_rate {
            info!("Device sample rate {} Hz differs from target {} Hz - resampling will be applied", device_sample_rate, sample_rate);
            let state = StreamResampler::new(device_sample_rate, sample_rate)
                .map_err(|e| AudioError::DeviceUnavailable(format!("Cannot adapt {} Hz input: {}", device_sample_rate, e)))?;
            Some(state)
        } else {
            None
        };

        debug!("Audio capture config: {} Hz, {} channels, {:?}", device_sample_rate, channels, config.sample_format());

        let stream_config: StreamConfig = config.config();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix_to_mono(data, channels);
                    match resampler.as_mut() {
                        Some(state) => {
                            let out = state.process(&mono);
                            if !out.is_empty() {
                                sink(&out);
                            }
                        }
                        None => sink(&mono),
                    }
                },
                |err| tracing::error!("Audio capture error: {}", err),
                None,
            )
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to build input stream: {}", e)))?;

        info!("Audio capture configured: device {} Hz -> output {} Hz", device_sample_rate, sample_rate);
        Ok(Box::new(stream))
    }
}

/// Accumulates samples of arbitrary run length into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size, pending: Vec::with_capacity(frame_size) }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_size {
                frames.push(std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size)));
            }
        }
        frames
    }
}

/// Resources held between `start` and `stop`.
struct ActiveCapture {
    stream: Box<dyn InputStream>,
    shutdown: Arc<AtomicBool>,
    drain_handle: JoinHandle<()>,
    delivery_handle: JoinHandle<()>,
}

/// Turns a live input device into a sequence of encoded PCM16 tokens.
pub struct CaptureEncoder<B: InputBackend = CpalInput> {
    backend: B,
    config: CaptureConfig,
    active: Option<ActiveCapture>,
}

impl CaptureEncoder<CpalInput> {
    /// Capture encoder over the default input device.
    pub fn with_default_device(config: CaptureConfig) -> Self {
        Self::new(CpalInput, config)
    }
}

impl<B: InputBackend> CaptureEncoder<B> {
    pub fn new(backend: B, config: CaptureConfig) -> Self {
        Self { backend, config, active: None }
    }

    pub fn config(&self) -> CaptureConfig {
        self.config
    }

    /// Whether the input device is currently held.
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the input device and start emitting one token per frame.
    ///
    /// # Errors
    /// - [`AudioError::CaptureActive`] if capture is already running
    /// - [`AudioError::DeviceUnavailable`] if the device cannot be acquired or started;
    ///   `on_chunk` is never called in that case
    pub fn start<F>(&mut self, mut on_chunk: F) -> AudioResult<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        if self.active.is_some() {
            warn!("Audio capture already running, ignoring start");
            return Err(AudioError::CaptureActive);
        }

        let ring = HeapRb::<f32>::new(CAPTURE_RING_SIZE);
        let (mut producer, mut consumer) = ring.split();

        let mut dropped_runs: u64 = 0;
        let sink: SampleSink = Box::new(move |samples: &[f32]| {
            let written = producer.push_slice(samples);
            if written < samples.len() {
                if dropped_runs.is_multiple_of(100) {
                    warn!("Capture ring buffer full, dropped {} sample runs", dropped_runs + 1);
                }
                dropped_runs += 1;
            }
        });

        let stream = self.backend.open(self.config.sample_rate, sink)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::sync_channel::<String>(TOKEN_CHANNEL_CAPACITY);

        let delivery_shutdown = shutdown.clone();
        let delivery_handle = std::thread::Builder::new()
            .name("capture-delivery".to_string())
            .spawn(move || {
                while let Ok(token) = receiver.recv() {
                    if delivery_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    on_chunk(token);
                }
                debug!("Capture delivery thread exiting");
            })
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to spawn capture delivery thread: {}", e)))?;

        let drain_shutdown = shutdown.clone();
        let frame_size = self.config.frame_size;
        let drain = std::thread::Builder::new().name("capture-drain".to_string()).spawn(move || {
            let mut assembler = FrameAssembler::new(frame_size);
            let mut read_buffer = vec![0.0f32; 2048];

            loop {
                if drain_shutdown.load(Ordering::Relaxed) {
                    debug!("Capture drain thread shutting down");
                    return;
                }

                if consumer.occupied_len() == 0 {
                    std::thread::sleep(Duration::from_micros(100));
                    continue;
                }

                let read = consumer.pop_slice(&mut read_buffer);
                for frame in assembler.push(&read_buffer[..read]) {
                    if sender.send(pcm::encode_frame(&frame)).is_err() {
                        debug!("Capture token channel closed, drain thread exiting");
                        return;
                    }
                }
            }
        });
        let drain_handle = match drain {
            Ok(handle) => handle,
            Err(e) => {
                // The sender went down with the closure, so delivery ends on its own
                shutdown.store(true, Ordering::SeqCst);
                let _ = delivery_handle.join();
                return Err(AudioError::DeviceUnavailable(format!("Failed to spawn capture drain thread: {}", e)));
            }
        };

        let active = ActiveCapture { stream, shutdown, drain_handle, delivery_handle };

        if let Err(e) = active.stream.play() {
            Self::release(active);
            return Err(e);
        }

        info!("Audio capture started: {} Hz, {} samples per frame", self.config.sample_rate, self.config.frame_size);
        self.active = Some(active);
        Ok(())
    }

    /// Release the input device. No callback runs after this returns.
    ///
    /// Safe to call when capture was never started or is already stopped.
    pub fn stop(&mut self) {
        match self.active.take() {
            Some(active) => {
                Self::release(active);
                info!("Audio capture stopped");
            }
            None => debug!("Audio capture not running, nothing to stop"),
        }
    }

    fn release(active: ActiveCapture) {
        let ActiveCapture { stream, shutdown, drain_handle, delivery_handle } = active;

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);

        if let Err(e) = drain_handle.join() {
            warn!("Failed to join capture drain thread: {:?}", e);
        }
        if let Err(e) = delivery_handle.join() {
            warn!("Failed to join capture delivery thread: {:?}", e);
        }
    }
}

impl<B: InputBackend> Drop for CaptureEncoder<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    type SharedSink = Arc<Mutex<Option<SampleSink>>>;

    /// Input backend that hands its sink to the test instead of a device.
    struct FakeInput {
        available: bool,
        sink: SharedSink,
        opened: Arc<AtomicUsize>,
    }

    struct FakeStream {
        sink: SharedSink,
    }

    impl InputStream for FakeStream {
        fn play(&self) -> AudioResult<()> {
            Ok(())
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.sink.lock().take();
        }
    }

    impl InputBackend for FakeInput {
        fn open(&mut self, _sample_rate: u32, sink: SampleSink) -> AudioResult<Box<dyn InputStream>> {
            if !self.available {
                return Err(AudioError::DeviceUnavailable("permission denied".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock() = Some(sink);
            Ok(Box::new(FakeStream { sink: self.sink.clone() }))
        }
    }

    fn fake(available: bool) -> (FakeInput, SharedSink) {
        let sink: SharedSink = Arc::new(Mutex::new(None));
        (FakeInput { available, sink: sink.clone(), opened: Arc::new(AtomicUsize::new(0)) }, sink)
    }

    fn feed(sink: &SharedSink, samples: &[f32]) {
        if let Some(sink) = sink.lock().as_mut() {
            sink(samples);
        }
    }

    fn small_frames() -> CaptureConfig {
        CaptureConfig { sample_rate: 16000, frame_size: 4 }
    }

    #[test]
    fn test_frame_assembler_splits_and_carries() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[1.0, 2.0, 3.0]).is_empty());
        let frames = assembler.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(assembler.push(&[10.0, 11.0, 12.0]), vec![vec![9.0, 10.0, 11.0, 12.0]]);
    }

    #[test]
    fn test_unavailable_device_fails_start() {
        let (backend, _sink) = fake(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut encoder = CaptureEncoder::new(backend, small_frames());
        let result = encoder.start(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))));
        assert!(!encoder.is_running());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_emits_one_token_per_full_frame() {
        let (backend, sink) = fake(true);
        let (tx, rx) = mpsc::channel();

        let mut encoder = CaptureEncoder::new(backend, small_frames());
        encoder
            .start(move |token| {
                let _ = tx.send(token);
            })
            .unwrap();

        feed(&sink, &[0.5, -0.5, 0.25]);
        feed(&sink, &[-0.25, 1.0, -1.0, 0.0, 0.0, 0.75]);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pcm::bytes_to_pcm16(&pcm::token_to_bytes(&first).unwrap()).unwrap(), vec![16384, -16384, 8192, -8192]);
        assert_eq!(pcm::bytes_to_pcm16(&pcm::token_to_bytes(&second).unwrap()).unwrap(), vec![32767, -32768, 0, 0]);

        // The trailing partial frame is held back
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        encoder.stop();
    }

    #[test]
    fn test_second_start_is_rejected() {
        let (backend, _sink) = fake(true);
        let opened = backend.opened.clone();
        let mut encoder = CaptureEncoder::new(backend, small_frames());

        encoder.start(|_| {}).unwrap();
        assert!(matches!(encoder.start(|_| {}), Err(AudioError::CaptureActive)));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (backend, _sink) = fake(true);
        let mut encoder = CaptureEncoder::new(backend, small_frames());

        encoder.stop();
        encoder.start(|_| {}).unwrap();
        encoder.stop();
        encoder.stop();
        assert!(!encoder.is_running());
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let (backend, sink) = fake(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut encoder = CaptureEncoder::new(backend, small_frames());
        encoder
            .start(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        feed(&sink, &[0.1; 8]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        encoder.stop();
        let after_stop = calls.load(Ordering::SeqCst);
        feed(&sink, &[0.1; 8]);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
        assert!(sink.lock().is_none());
    }

    #[test]
    fn test_stop_returns_once_stalled_consumer_goes_away() {
        let (backend, sink) = fake(true);
        let (tx, rx) = mpsc::sync_channel::<String>(1);

        let mut encoder = CaptureEncoder::new(backend, small_frames());
        encoder
            .start(move |token| {
                let _ = tx.send(token);
            })
            .unwrap();

        // Four frames into a one-slot consumer: delivery parks on the second
        feed(&sink, &[0.1; 16]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while rx.try_recv().is_err() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));

        drop(rx);
        encoder.stop();
        assert!(!encoder.is_running());
    }

    #[test]
    fn test_chunks_delivered_on_named_thread() {
        let (backend, sink) = fake(true);
        let (tx, rx) = mpsc::channel();

        let mut encoder = CaptureEncoder::new(backend, small_frames());
        encoder
            .start(move |_| {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            })
            .unwrap();

        feed(&sink, &[0.0; 4]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().as_deref(), Some("capture-delivery"));
        encoder.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let (backend, sink) = fake(true);
        let opened = backend.opened.clone();
        let mut encoder = CaptureEncoder::new(backend, small_frames());

        encoder.start(|_| {}).unwrap();
        encoder.stop();

        let (tx, rx) = mpsc::channel();
        encoder
            .start(move |token| {
                let _ = tx.send(token);
            })
            .unwrap();
        feed(&sink, &[0.0; 4]);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
