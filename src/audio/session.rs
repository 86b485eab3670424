//! Playback session: one thread, one command queue, one scheduler.
//!
//! Network arrivals, resume requests and device completions are all funneled
//! into a single FIFO of [`PlaybackCommand`]s consumed by the session thread.
//! The scheduler and its device live on that thread only, so `advance` can
//! never be re-entered concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::playback::CpalOutput;
use super::scheduler::{ChunkId, OutputDevice, PlaybackConfig, PlaybackScheduler};
use crate::error::{AudioError, AudioResult};

/// Work item for the session thread.
#[derive(Debug)]
pub enum PlaybackCommand {
    Submit(String),
    Finished(ChunkId),
    Resume(SyncSender<AudioResult<()>>),
    Close,
}

/// Handed to the output device so it can report finished buffers.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    tx: Sender<PlaybackCommand>,
}

impl CompletionNotifier {
    pub fn finished(&self, id: ChunkId) {
        // Fails only once the session has shut down
        let _ = self.tx.send(PlaybackCommand::Finished(id));
    }
}

/// Cloneable, thread-safe handle for pushing received tokens.
#[derive(Debug, Clone)]
pub struct ChunkSubmitter {
    tx: Sender<PlaybackCommand>,
}

impl ChunkSubmitter {
    pub fn submit(&self, token: impl Into<String>) {
        if self.tx.send(PlaybackCommand::Submit(token.into())).is_err() {
            warn!("Playback session closed, dropping audio chunk");
        }
    }
}

/// Snapshot of session state for status display and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub queue_depth: usize,
    pub chunks_received: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub decode_failures: u64,
    pub scheduling_failures: u64,
}

#[derive(Debug, Default)]
struct SharedStatus {
    playing: AtomicBool,
    queued: AtomicUsize,
    received: AtomicU64,
    played: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    scheduling_failures: AtomicU64,
}

impl SharedStatus {
    fn publish<D: OutputDevice>(&self, scheduler: &PlaybackScheduler<D>) {
        let stats = scheduler.stats();
        self.playing.store(scheduler.is_playing(), Ordering::Release);
        self.queued.store(scheduler.queue_depth(), Ordering::Release);
        self.received.store(stats.chunks_received, Ordering::Release);
        self.played.store(stats.chunks_played, Ordering::Release);
        self.dropped.store(stats.chunks_dropped, Ordering::Release);
        self.decode_failures.store(stats.decode_failures, Ordering::Release);
        self.scheduling_failures.store(stats.scheduling_failures, Ordering::Release);
    }

    fn snapshot(&self) -> PlaybackStatus {
        PlaybackStatus {
            is_playing: self.playing.load(Ordering::Acquire),
            queue_depth: self.queued.load(Ordering::Acquire),
            chunks_received: self.received.load(Ordering::Acquire),
            chunks_played: self.played.load(Ordering::Acquire),
            chunks_dropped: self.dropped.load(Ordering::Acquire),
            decode_failures: self.decode_failures.load(Ordering::Acquire),
            scheduling_failures: self.scheduling_failures.load(Ordering::Acquire),
        }
    }
}

/// Owns a playback thread driving one [`PlaybackScheduler`].
pub struct PlaybackSession {
    tx: Sender<PlaybackCommand>,
    status: Arc<SharedStatus>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    /// Start a session on the default output device.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`] if the output device cannot be opened.
    pub fn with_default_device(config: PlaybackConfig) -> AudioResult<Self> {
        Self::spawn(config, move |notifier| CpalOutput::open(config.sample_rate, notifier))
    }

    /// Start a session whose device is built on the session thread by `open_device`.
    ///
    /// # Errors
    /// Returns whatever `open_device` fails with, or
    /// [`AudioError::DeviceUnavailable`] if the thread cannot be started.
    pub fn spawn<D, F>(config: PlaybackConfig, open_device: F) -> AudioResult<Self>
    where
        D: OutputDevice + 'static,
        F: FnOnce(CompletionNotifier) -> AudioResult<D> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<AudioResult<()>>(1);
        let notifier = CompletionNotifier { tx: tx.clone() };
        let status = Arc::new(SharedStatus::default());
        let thread_status = status.clone();

        let handle = std::thread::Builder::new()
            .name("playback-session".to_string())
            .spawn(move || {
                let device = match open_device(notifier) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let mut scheduler = PlaybackScheduler::new(device, config);
                run_commands(&mut scheduler, rx, &thread_status);
                scheduler.release();
                thread_status.publish(&scheduler);
                debug!("Playback session thread exiting");
            })
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to spawn playback thread: {}", e)))?;

        let setup = ready_rx.recv().unwrap_or_else(|_| Err(AudioError::DeviceUnavailable("Playback thread exited during setup".to_string())));
        if let Err(e) = setup {
            let _ = handle.join();
            return Err(e);
        }

        info!("Playback session started at {} Hz", config.sample_rate);
        Ok(Self { tx, status, handle: Some(handle) })
    }

    /// Queue one received token. Decode errors are handled on the session thread.
    pub fn submit(&self, token: impl Into<String>) {
        self.submitter().submit(token);
    }

    /// Handle that other threads (capture callbacks, transports) can submit through.
    pub fn submitter(&self) -> ChunkSubmitter {
        ChunkSubmitter { tx: self.tx.clone() }
    }

    /// Resume a suspended output device and wait for the outcome.
    ///
    /// # Errors
    /// Returns [`AudioError::DeviceUnavailable`] if the device cannot be resumed
    /// or the session is closed.
    pub fn resume(&self) -> AudioResult<()> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(PlaybackCommand::Resume(reply_tx))
            .map_err(|_| AudioError::DeviceUnavailable("Playback session closed".to_string()))?;
        reply_rx.recv().map_err(|_| AudioError::DeviceUnavailable("Playback session closed".to_string()))?
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.snapshot()
    }

    pub fn is_playing(&self) -> bool {
        self.status.playing.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.status.queued.load(Ordering::Acquire)
    }

    /// Discard queued audio, release the device and join the session thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(PlaybackCommand::Close);
            if let Err(e) = handle.join() {
                warn!("Failed to join playback session thread: {:?}", e);
            }
            info!("Playback session closed");
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_commands<D: OutputDevice>(scheduler: &mut PlaybackScheduler<D>, rx: Receiver<PlaybackCommand>, status: &SharedStatus) {
    while let Ok(command) = rx.recv() {
        match command {
            PlaybackCommand::Submit(token) => {
                scheduler.submit(&token);
            }
            PlaybackCommand::Finished(id) => scheduler.on_finished(id),
            PlaybackCommand::Resume(reply) => {
                let _ = reply.send(scheduler.resume());
            }
            PlaybackCommand::Close => return,
        }
        status.publish(scheduler);
    }
}
