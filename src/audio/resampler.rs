//! Sample-rate conversion between the pipeline rate and the physical device rate.
//!
//! Capture streams through [`StreamResampler`], which keeps state across device
//! callbacks. Playback converts one whole chunk at a time with [`resample`].

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

/// Chunk size for FFT-based resampling.
const CHUNK_SIZE: usize = 1024;

/// Number of sub-chunks for FFT processing (higher = better quality but more CPU).
const SUB_CHUNKS: usize = 2;

fn new_fft(from_rate: u32, to_rate: u32) -> Result<Fft<f32>> {
    Fft::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1, FixedSync::Input).context("Failed to create resampler")
}

/// Number of output samples that `len` input samples map to.
pub fn output_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    ((len as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize
}

/// Streaming mono resampler for device callbacks.
///
/// Input arrives in arbitrary sizes and is accumulated until a full FFT chunk
/// is available.
pub struct StreamResampler {
    resampler: Fft<f32>,
    pending: Vec<f32>,
    output_buffer: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting `from_rate` to `to_rate`.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = new_fft(from_rate, to_rate)?;
        let output_frames_max = resampler.output_frames_max();
        Ok(Self { resampler, pending: Vec::with_capacity(CHUNK_SIZE * 2), output_buffer: vec![0.0; output_frames_max] })
    }

    /// Feed samples and return whatever output became available.
    ///
    /// The returned vector is empty while less than one chunk is pending.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() >= CHUNK_SIZE {
            let chunk: Vec<f32> = self.pending.drain(..CHUNK_SIZE).collect();
            match process_chunk(&mut self.resampler, &chunk, &mut self.output_buffer) {
                Ok(frames) => out.extend_from_slice(&self.output_buffer[..frames]),
                Err(e) => tracing::warn!("Capture resampling failed: {}", e),
            }
        }
        out
    }
}

fn process_chunk(resampler: &mut Fft<f32>, chunk: &[f32], output: &mut [f32]) -> Result<usize> {
    let output_frames_max = output.len();
    let input_adapter = InterleavedSlice::new(chunk, 1, CHUNK_SIZE).context("Failed to create input adapter")?;
    let mut output_adapter = InterleavedSlice::new_mut(output, 1, output_frames_max).context("Failed to create output adapter")?;
    let (_, frames_written) =
        resampler.process_into_buffer(&input_adapter, &mut output_adapter, None).map_err(|e| anyhow::anyhow!("Resampling error: {}", e))?;
    Ok(frames_written)
}

/// Resample a complete mono buffer.
///
/// The result always has exactly [`output_len`] samples, so a chunk keeps its
/// duration on the device timeline. The filter delay is trimmed from the head
/// and the tail is flushed with silence, so no real audio is lost at either end.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler = new_fft(from_rate, to_rate)?;
    let mut output_buffer = vec![0.0f32; resampler.output_frames_max()];
    let delay = resampler.output_delay();
    let expected_len = output_len(samples.len(), from_rate, to_rate);
    let wanted = delay + expected_len;
    let mut output = Vec::with_capacity(wanted + output_buffer.len());

    let silence = [0.0f32; CHUNK_SIZE];
    let mut input = samples.chunks(CHUNK_SIZE);
    while output.len() < wanted {
        let frames = match input.next() {
            Some(chunk) if chunk.len() == CHUNK_SIZE => process_chunk(&mut resampler, chunk, &mut output_buffer)?,
            Some(chunk) => {
                let mut padded = chunk.to_vec();
                padded.resize(CHUNK_SIZE, 0.0);
                process_chunk(&mut resampler, &padded, &mut output_buffer)?
            }
            None => process_chunk(&mut resampler, &silence, &mut output_buffer)?,
        };
        if frames == 0 {
            anyhow::bail!("Resampler produced no output while flushing");
        }
        output.extend_from_slice(&output_buffer[..frames]);
    }

    output.drain(..delay);
    output.truncate(expected_len);
    Ok(output)
}
