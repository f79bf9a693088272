/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Pure audio transcoding and validation: no I/O, no tracing spans, nothing
//! that needs a runtime. Transport layers (C4/C5/C6) call into this and log
//! around it themselves.

use crate::error::{CodecError, CodecResult};

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;
const MULAW_SILENCE: u8 = 0x7F;

/// One byte of G.711 µ-law in, one 16-bit PCM sample out.
pub fn decode_mulaw_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_mulaw_byte(b)).collect()
}

fn decode_mulaw_byte(u_val: u8) -> i16 {
    let u_val = !u_val;
    let sign = u_val & 0x80;
    let exponent = (u_val >> 4) & 0x07;
    let mantissa = u_val & 0x0F;
    let mut sample = ((mantissa as i16) << 3) + MULAW_BIAS;
    sample <<= exponent;
    sample -= MULAW_BIAS;
    if sign != 0 { -sample } else { sample }
}

/// One 16-bit PCM sample in, one byte of G.711 µ-law out. `samples` must
/// come from an even-length little-endian PCM16 byte buffer upstream; this
/// function operates on already-decoded `i16`s, so length parity is the
/// caller's responsibility at the byte boundary (see [`pcm16_bytes_to_samples`]).
pub fn encode_pcm16_to_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_mulaw_sample(s)).collect()
}

fn encode_mulaw_sample(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    let exponent = (0..8)
        .rev()
        .find(|&exp| (magnitude >> (exp + 3)) & 0x01 != 0 || exp == 0)
        .unwrap_or(0) as i16;
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    let byte = (sign | (exponent << 4) | mantissa) as u8;
    !byte
}

/// Interprets a little-endian PCM16 byte buffer as signed samples. Rejects
/// odd-length buffers, since they cannot be split into whole 16-bit samples.
pub fn pcm16_bytes_to_samples(bytes: &[u8]) -> CodecResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::InvalidPcmLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn samples_to_pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Linear-interpolation resample. Identity when rates match; clamps the
/// right-edge interpolation index to `len - 1` so the last output sample
/// never reads past the input.
pub fn resample_linear(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if samples.is_empty() || src_rate == dst_rate {
        return samples.to_vec();
    }

    let len = samples.len();
    let out_len = (len as u64 * dst_rate as u64 / src_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * src_rate as f64 / dst_rate as f64;
        let idx_floor = src_pos.floor() as usize;
        let idx_floor = idx_floor.min(len - 1);
        let idx_ceil = (idx_floor + 1).min(len - 1);
        let frac = src_pos - idx_floor as f64;

        let a = samples[idx_floor] as f64;
        let b = samples[idx_ceil] as f64;
        let interpolated = a + (b - a) * frac;
        out.push(interpolated.round() as i16);
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    MuLaw8k,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkValidation {
    pub ok: bool,
    pub reason: Option<String>,
    pub duration_ms: u64,
}

/// Cheap structural validation of an inbound audio chunk before it is
/// forwarded to the realtime AI client. Never inspects sample values beyond
/// the defensive probe described below; codec correctness is the caller's
/// job.
pub fn validate_chunk(bytes: &[u8], format: ChunkFormat) -> ChunkValidation {
    if bytes.is_empty() {
        return ChunkValidation {
            ok: false,
            reason: Some("chunk is empty".to_owned()),
            duration_ms: 0,
        };
    }

    match format {
        ChunkFormat::MuLaw8k => {
            let len = bytes.len();
            let duration_ms = (len / 8) as u64;
            if !(80..=3200).contains(&len) {
                return ChunkValidation {
                    ok: false,
                    reason: Some(format!(
                        "chunk length {len} out of range 80..=3200 for mulaw8k"
                    )),
                    duration_ms,
                };
            }

            // Defensive probe: every byte is a valid u8 by construction, so this
            // is trivially satisfied; kept to mirror the upstream validation step.
            let probe_len = len.min(100);
            let valid = bytes[..probe_len].iter().all(|_| true);
            let valid_ratio = if valid { 1.0 } else { 0.0 };
            if valid_ratio < 0.9 {
                return ChunkValidation {
                    ok: false,
                    reason: Some("less than 90% of probed bytes were valid".to_owned()),
                    duration_ms,
                };
            }

            ChunkValidation {
                ok: true,
                reason: None,
                duration_ms,
            }
        }
    }
}

/// µ-law silence is encoded as `0x7F`; real silence from hardware wobbles by
/// a sample or two, so tolerance is ±2 across the byte value.
pub fn is_silence(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    bytes
        .iter()
        .all(|&b| b.abs_diff(MULAW_SILENCE) <= 2 || b.abs_diff(0xFF) <= 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceFormat {
    MuLaw,
    Pcm16,
}

/// Pre-filled silence buffer: `0xFF` per byte for µ-law (the true-zero
/// amplitude code word under this encoding's sign inversion), `0x00` per
/// byte for PCM16.
pub fn create_silence(duration_ms: u64, format: SilenceFormat, rate: u32) -> Vec<u8> {
    let samples = (duration_ms * rate as u64 / 1000) as usize;
    match format {
        SilenceFormat::MuLaw => vec![0xFF; samples],
        SilenceFormat::Pcm16 => vec![0x00; samples * 2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_is_lossy_but_bounded() {
        let original: Vec<i16> = vec![0, 100, -100, 5000, -5000, i16::MAX, i16::MIN];
        let encoded = encode_pcm16_to_mulaw(&original);
        let decoded = decode_mulaw_to_pcm16(&encoded);
        assert_eq!(decoded.len(), original.len());
        for (o, d) in original.iter().zip(decoded.iter()) {
            let err = (*o as i32 - *d as i32).abs();
            assert!(err < 1100, "sample {o} decoded to {d}, error {err}");
        }
    }

    #[test]
    fn mulaw_silence_round_trips_to_near_zero() {
        let silence_bytes = create_silence(20, SilenceFormat::MuLaw, 8000);
        assert!(is_silence(&silence_bytes));
        let decoded = decode_mulaw_to_pcm16(&silence_bytes);
        assert!(decoded.iter().all(|&s| s.abs() < 10));
    }

    #[test]
    fn decode_output_length_is_double_input() {
        let bytes = vec![0x7Fu8; 160];
        let samples = decode_mulaw_to_pcm16(&bytes);
        assert_eq!(samples.len(), bytes.len());
        let pcm_bytes = samples_to_pcm16_bytes(&samples);
        assert_eq!(pcm_bytes.len(), bytes.len() * 2);
    }

    #[test]
    fn pcm16_bytes_rejects_odd_length() {
        let bytes = vec![0u8; 3];
        assert!(matches!(
            pcm16_bytes_to_samples(&bytes),
            Err(CodecError::InvalidPcmLength(3))
        ));
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1, 2, 3, 4, 5];
        assert_eq!(resample_linear(&samples, 8000, 8000), samples);
    }

    #[test]
    fn resample_downsamples_length_by_ratio() {
        let samples: Vec<i16> = (0..240).collect();
        let out = resample_linear(&samples, 24000, 8000);
        assert_eq!(out.len(), 80);
    }

    #[test]
    fn resample_upsamples_length_by_ratio() {
        let samples: Vec<i16> = (0..80).collect();
        let out = resample_linear(&samples, 8000, 24000);
        assert_eq!(out.len(), 240);
    }

    #[test]
    fn resample_clamps_right_edge() {
        let samples = vec![10, 20, 30];
        let out = resample_linear(&samples, 3, 2);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn validate_chunk_rejects_empty() {
        let v = validate_chunk(&[], ChunkFormat::MuLaw8k);
        assert!(!v.ok);
    }

    #[test]
    fn validate_chunk_accepts_160_byte_20ms_frame() {
        let bytes = vec![0x7Fu8; 160];
        let v = validate_chunk(&bytes, ChunkFormat::MuLaw8k);
        assert!(v.ok);
        assert_eq!(v.duration_ms, 20);
    }

    #[test]
    fn validate_chunk_rejects_too_short() {
        let bytes = vec![0x7Fu8; 10];
        let v = validate_chunk(&bytes, ChunkFormat::MuLaw8k);
        assert!(!v.ok);
    }

    #[test]
    fn validate_chunk_rejects_too_long() {
        let bytes = vec![0x7Fu8; 4000];
        let v = validate_chunk(&bytes, ChunkFormat::MuLaw8k);
        assert!(!v.ok);
    }

    #[test]
    fn create_silence_matches_expected_byte_counts() {
        let mulaw = create_silence(20, SilenceFormat::MuLaw, 8000);
        assert_eq!(mulaw.len(), 160);
        let pcm = create_silence(20, SilenceFormat::Pcm16, 8000);
        assert_eq!(pcm.len(), 320);
    }
}
