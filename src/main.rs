//! Mission Audio - diagnostic front end for the realtime audio pipeline.
//!
//! `capture` prints the outbound audio messages a transport would send,
//! `play` feeds received tokens from stdin into a playback session, and
//! `loopback` runs the whole encode/decode/schedule path on local devices.

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use config::{AppConfig, Mode};
use mission_audio::audio::{CaptureEncoder, PlaybackSession};

/// Audio still rendering after the last completion event.
const PLAYBACK_TAIL: Duration = Duration::from_millis(100);

/// Outbound audio message, one per captured frame.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
    sample_rate: u32,
}

/// Inbound audio message; only the token is used.
#[derive(Debug, Deserialize)]
struct InboundAudio {
    data: String,
}

/// Extract a token from one stdin line: either a JSON audio message or a bare token.
fn extract_token(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('{') {
        return match serde_json::from_str::<InboundAudio>(line) {
            Ok(message) => Some(message.data),
            Err(e) => {
                warn!("Skipping unparseable audio message: {}", e);
                None
            }
        };
    }
    Some(line.to_string())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }

    shutdown.cancel();
}

/// Close a playback session without blocking a runtime worker on the thread join.
async fn close_session(session: PlaybackSession) {
    if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
        warn!("Playback session close task failed: {}", e);
    }
}

async fn run_capture(config: &AppConfig, shutdown: CancellationToken) -> Result<()> {
    let (token_tx, mut token_rx) = mpsc::channel::<String>(64);

    let mut encoder = CaptureEncoder::with_default_device(config.capture_config());
    encoder
        .start(move |token| {
            if token_tx.blocking_send(token).is_err() {
                debug!("Token receiver closed");
            }
        })
        .context("Failed to start microphone capture")?;

    let mut stdout = tokio::io::stdout();
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            Some(token) = token_rx.recv() => {
                let message = AudioMessage { kind: "audio", data: &token, sample_rate: config.capture_rate };
                let mut line = serde_json::to_string(&message)?;
                line.push('\n');
                stdout.write_all(line.as_bytes()).await.context("Failed to write to stdout")?;
                stdout.flush().await?;
                frames += 1;
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // A delivery thread parked on a full channel only wakes once the receiver is gone
    drop(token_rx);
    tokio::task::block_in_place(|| encoder.stop());
    info!("✅ Captured {} frames", frames);
    Ok(())
}

async fn run_play(config: &AppConfig, shutdown: CancellationToken) -> Result<()> {
    let session = PlaybackSession::with_default_device(config.playback_config()).context("Failed to open audio output")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if let Some(token) = extract_token(&line) {
                            session.submit(token);
                            submitted += 1;
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown.cancelled() => {
                close_session(session).await;
                return Ok(());
            }
        }
    }

    debug!("stdin closed after {} chunks, waiting for playback to drain", submitted);
    loop {
        let status = session.status();
        if status.chunks_received >= submitted && !status.is_playing && status.queue_depth == 0 {
            // The device reports completion slightly ahead of the last frame
            tokio::time::sleep(PLAYBACK_TAIL).await;
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    let status = session.status();
    info!(
        "✅ Played {} of {} chunks ({} dropped, {} undecodable, {} unschedulable)",
        status.chunks_played, status.chunks_received, status.chunks_dropped, status.decode_failures, status.scheduling_failures
    );
    close_session(session).await;
    Ok(())
}

async fn run_loopback(config: &AppConfig, shutdown: CancellationToken) -> Result<()> {
    let session = PlaybackSession::with_default_device(config.playback_config()).context("Failed to open audio output")?;
    let submitter = session.submitter();

    let mut encoder = CaptureEncoder::with_default_device(config.capture_config());
    encoder.start(move |token| submitter.submit(token)).context("Failed to start microphone capture")?;

    info!("🔁 Loopback running, press Ctrl+C to stop");
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Loopback status: {}", serde_json::to_string(&session.status())?);
            }
            _ = shutdown.cancelled() => break,
        }
    }

    tokio::task::block_in_place(|| encoder.stop());
    close_session(session).await;
    info!("✅ Loopback stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| if config.verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎙️  Mission Audio v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(2);
    }
    config.log_config();

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    match config.mode {
        Mode::Capture => run_capture(&config, shutdown).await,
        Mode::Play => run_play(&config, shutdown).await,
        Mode::Loopback => run_loopback(&config, shutdown).await,
    }
}
