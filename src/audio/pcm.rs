//! PCM16 transcoding shared by capture and playback.
//!
//! Float samples in [-1.0, 1.0] are packed as little-endian signed 16-bit PCM
//! and carried as base64 text tokens. Encoding scales negative and positive
//! samples separately (32768 / 32767) while decoding always divides by 32768;
//! the remote agent expects exactly this mapping, so the asymmetry is kept.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;

use crate::error::DecodeError;

/// Divisor used for negative samples on encode and for every sample on decode.
const NEGATIVE_SCALE: f32 = 32768.0;

/// Multiplier used for non-negative samples on encode.
const POSITIVE_SCALE: f32 = 32767.0;

/// Standard-alphabet decoder that tolerates missing padding.
/// URL-safe input is normalized to this alphabet before decoding.
const TOKEN_DECODER: GeneralPurpose =
    GeneralPurpose::new(&alphabet::STANDARD, GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent));

/// Convert float samples to signed 16-bit PCM.
///
/// Each sample is clamped to [-1.0, 1.0] and rounded to the nearest integer.
/// NaN maps to silence.
pub fn encode_float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            let scaled = if s < 0.0 { s * NEGATIVE_SCALE } else { s * POSITIVE_SCALE };
            scaled.round() as i16
        })
        .collect()
}

/// Convert signed 16-bit PCM to float samples.
pub fn decode_pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / NEGATIVE_SCALE).collect()
}

/// Pack PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Unpack little-endian bytes into PCM16 samples.
///
/// # Errors
/// Returns [`DecodeError::OddByteLength`] if `bytes` has an odd length.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if !bytes.len().is_multiple_of(2) {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }
    Ok(bytes.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])).collect())
}

/// Encode bytes as a standard-alphabet base64 token.
pub fn bytes_to_token(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 token written in either the standard or the URL-safe alphabet.
///
/// ASCII whitespace is ignored and padding is optional.
///
/// # Errors
/// Returns [`DecodeError::InvalidToken`] for characters outside both alphabets
/// or non-zero leftover bits.
pub fn token_to_bytes(token: &str) -> Result<Vec<u8>, DecodeError> {
    let normalized: String = token
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    Ok(TOKEN_DECODER.decode(normalized)?)
}

/// Encode one capture frame straight to a token.
pub fn encode_frame(samples: &[f32]) -> String {
    bytes_to_token(&pcm16_to_bytes(&encode_float_to_pcm16(samples)))
}

/// Decode one received token straight to float samples.
///
/// # Errors
/// Returns a [`DecodeError`] if the token or its payload is malformed.
pub fn decode_chunk(token: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = token_to_bytes(token)?;
    let samples = bytes_to_pcm16(&bytes)?;
    Ok(decode_pcm16_to_float(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_full_scale_and_clamping() {
        let pcm = encode_float_to_pcm16(&[1.0, -1.0, 2.5, -3.0, 0.0]);
        assert_eq!(pcm, vec![32767, -32768, 32767, -32768, 0]);
    }

    #[test]
    fn test_encode_rounds_to_nearest() {
        // 0.5 * 32767 = 16383.5 -> 16384, -0.5 * 32768 = -16384
        let pcm = encode_float_to_pcm16(&[0.5, -0.5]);
        assert_eq!(pcm, vec![16384, -16384]);
    }

    #[test]
    fn test_encode_nan_is_silence() {
        assert_eq!(encode_float_to_pcm16(&[f32::NAN]), vec![0]);
    }

    #[test]
    fn test_decode_uses_single_divisor() {
        let floats = decode_pcm16_to_float(&[-32768, 32767, 0]);
        assert_eq!(floats[0], -1.0);
        assert_eq!(floats[1], 32767.0 / 32768.0);
        assert_eq!(floats[2], 0.0);
    }

    #[test]
    fn test_float_round_trip_within_one_step() {
        let step = 1.0 / 32768.0;
        for i in -1000..=0 {
            let s = i as f32 / 1000.0;
            let back = decode_pcm16_to_float(&encode_float_to_pcm16(&[s]))[0];
            assert!((back - s).abs() <= step * 0.5 + 1e-7, "sample {} came back as {}", s, back);
        }
        // Positive samples also carry the 32767/32768 scale bias
        for i in 0..=1000 {
            let s = i as f32 / 1000.0;
            let back = decode_pcm16_to_float(&encode_float_to_pcm16(&[s]))[0];
            assert!((back - s).abs() <= step * 1.5 + 1e-7, "sample {} came back as {}", s, back);
        }
    }

    #[test]
    fn test_little_endian_packing() {
        assert_eq!(pcm16_to_bytes(&[1, -2]), vec![0x01, 0x00, 0xfe, 0xff]);
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xfe, 0xff]).unwrap(), vec![1, -2]);
    }

    #[test]
    fn test_odd_payload_is_rejected() {
        let err = bytes_to_pcm16(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, DecodeError::OddByteLength(3)));
    }

    #[test]
    fn test_token_uses_standard_alphabet() {
        assert_eq!(bytes_to_token(&[0xfb, 0xff, 0xbf]), "+/+/");
    }

    #[test]
    fn test_token_accepts_both_alphabets() {
        let bytes = vec![0xfb, 0xff, 0xbf, 0x00, 0x10, 0x83];
        let standard = bytes_to_token(&bytes);
        let url_safe = standard.replace('+', "-").replace('/', "_");
        assert_ne!(standard, url_safe);
        assert_eq!(token_to_bytes(&standard).unwrap(), bytes);
        assert_eq!(token_to_bytes(&url_safe).unwrap(), bytes);
    }

    #[test]
    fn test_token_padding_is_optional() {
        assert_eq!(token_to_bytes("AAE=").unwrap(), vec![0x00, 0x01]);
        assert_eq!(token_to_bytes("AAE").unwrap(), vec![0x00, 0x01]);
    }

    #[test]
    fn test_invalid_characters_fail() {
        assert!(matches!(token_to_bytes("AA*A"), Err(DecodeError::InvalidToken(_))));
    }

    #[test]
    fn test_leftover_bits_fail() {
        // 'B' leaves a non-zero bit after the only full byte
        assert!(matches!(token_to_bytes("AB=="), Err(DecodeError::InvalidToken(_))));
    }

    #[test]
    fn test_frame_round_trip() {
        let frame: Vec<f32> = (0..4096).map(|i| ((i as f32) * 0.01).sin() * 0.8).collect();
        let token = encode_frame(&frame);
        let decoded = decode_chunk(&token).unwrap();
        assert_eq!(decoded.len(), frame.len());
        for (a, b) in frame.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.5 / 32768.0 + 1e-7);
        }
    }

    #[test]
    fn test_empty_token_decodes_to_no_samples() {
        assert!(decode_chunk("").unwrap().is_empty());
    }
}
