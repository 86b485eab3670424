//! Application configuration and CLI argument parsing.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use mission_audio::audio::{CaptureConfig, PlaybackConfig};

/// Lowest and highest sample rates accepted on the command line.
const MIN_SAMPLE_RATE: u32 = 8000;
const MAX_SAMPLE_RATE: u32 = 192000;

/// Largest capture frame, in samples.
const MAX_FRAME_SIZE: usize = 65536;

/// What the binary does with the audio pipeline.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Capture the microphone and print one JSON audio message per frame to stdout
    Capture,
    /// Play PCM16 tokens (bare or JSON audio messages) read line by line from stdin
    Play,
    /// Route the microphone through encode, decode and scheduled playback
    Loopback,
}

/// Mission audio configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "mission-audio")]
#[command(author, version, about = "Realtime PCM16 capture and gapless playback", long_about = None)]
pub struct AppConfig {
    #[command(subcommand)]
    pub mode: Mode,

    /// Microphone capture sample rate
    #[arg(long, global = true, env = "MISSION_CAPTURE_RATE", default_value = "16000")]
    pub capture_rate: u32,

    /// Samples per captured frame (one token per frame)
    #[arg(long, global = true, default_value = "4096")]
    pub frame_size: usize,

    /// Sample rate of received PCM16 chunks
    #[arg(long, global = true, env = "MISSION_PLAYBACK_RATE", default_value = "24000")]
    pub playback_rate: u32,

    /// Maximum queued chunks before the oldest is dropped
    #[arg(long, global = true, default_value = "512")]
    pub max_queued_chunks: usize,

    /// Enable verbose logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Capture settings for the encoder.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig { sample_rate: self.capture_rate, frame_size: self.frame_size }
    }

    /// Playback settings; loopback plays back at the capture rate.
    pub fn playback_config(&self) -> PlaybackConfig {
        let sample_rate = if self.mode == Mode::Loopback { self.capture_rate } else { self.playback_rate };
        PlaybackConfig { sample_rate, max_queued_chunks: self.max_queued_chunks }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [("Capture", self.capture_rate), ("Playback", self.playback_rate)] {
            if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
                anyhow::bail!("{} rate must be between {} and {} Hz, got {}", name, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE, rate);
            }
        }

        if self.frame_size == 0 || self.frame_size > MAX_FRAME_SIZE {
            anyhow::bail!("Frame size must be between 1 and {} samples", MAX_FRAME_SIZE);
        }

        if self.max_queued_chunks == 0 {
            anyhow::bail!("Max queued chunks must be at least 1");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Mode: {:?}", self.mode);
        if self.mode != Mode::Play {
            info!("  Capture: {} Hz, {} samples per frame", self.capture_rate, self.frame_size);
        }
        if self.mode != Mode::Capture {
            info!("  Playback: {} Hz, queue limit {} chunks", self.playback_config().sample_rate, self.max_queued_chunks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::try_parse_from(["mission-audio", "play"]).unwrap();
        assert_eq!(config.mode, Mode::Play);
        assert_eq!(config.capture_config(), CaptureConfig::default());
        assert_eq!(config.playback_config(), PlaybackConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let config = AppConfig::try_parse_from(["mission-audio", "capture", "--frame-size", "1024", "-v"]).unwrap();
        assert_eq!(config.frame_size, 1024);
        assert!(config.verbose);
    }

    #[test]
    fn test_loopback_plays_at_capture_rate() {
        let config = AppConfig::try_parse_from(["mission-audio", "loopback", "--capture-rate", "22050"]).unwrap();
        assert_eq!(config.playback_config().sample_rate, 22050);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::try_parse_from(["mission-audio", "play"]).unwrap();
        config.playback_rate = 1000;
        assert!(config.validate().is_err());

        config.playback_rate = 24000;
        config.frame_size = 0;
        assert!(config.validate().is_err());

        config.frame_size = 4096;
        config.max_queued_chunks = 0;
        assert!(config.validate().is_err());
    }
}
