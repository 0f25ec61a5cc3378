//! Minimal RIFF/WAVE reader for manifest audio
//!
//! Handles 16-bit PCM and 32-bit IEEE float data with any channel count;
//! multi-channel audio is mixed down to mono.

use std::path::Path;

use crate::error::{Error, Result};

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;

/// Decoded mono waveform
#[derive(Debug, Clone)]
pub struct WavData {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl WavData {
    /// Length in seconds at the file's sample rate
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate_hz)
    }
}

#[derive(Debug, Default)]
struct FmtChunk {
    audio_format: u16,
    channels: u16,
    sample_rate_hz: u32,
    bits_per_sample: u16,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decode WAV bytes into mono `f32` samples
pub fn decode_wav(bytes: &[u8]) -> Result<WavData> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(Error::Audio("missing RIFF/WAVE header".into()));
    }

    let mut fmt: Option<FmtChunk> = None;
    let mut payload: Option<&[u8]> = None;

    let mut cursor = 12usize;
    while cursor + 8 <= bytes.len() {
        let id = &bytes[cursor..cursor + 4];
        let size = u32_at(bytes, cursor + 4) as usize;
        let start = cursor + 8;
        let end = start.saturating_add(size);
        if end > bytes.len() {
            return Err(Error::Audio(format!(
                "chunk {:?} overruns file ({end} > {})",
                String::from_utf8_lossy(id),
                bytes.len()
            )));
        }

        match id {
            b"fmt " if size >= 16 => {
                fmt = Some(FmtChunk {
                    audio_format: u16_at(bytes, start),
                    channels: u16_at(bytes, start + 2),
                    sample_rate_hz: u32_at(bytes, start + 4),
                    bits_per_sample: u16_at(bytes, start + 14),
                });
            }
            b"data" => payload = Some(&bytes[start..end]),
            _ => {}
        }

        // Chunks are word aligned
        cursor = end + (size & 1);
    }

    let fmt = fmt.ok_or_else(|| Error::Audio("missing fmt chunk".into()))?;
    let payload = payload.ok_or_else(|| Error::Audio("missing data chunk".into()))?;
    if fmt.channels == 0 {
        return Err(Error::Audio("zero channels".into()));
    }

    let decode: fn(&[u8]) -> f32 = match (fmt.audio_format, fmt.bits_per_sample) {
        (FORMAT_PCM, 16) => |b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0,
        (FORMAT_IEEE_FLOAT, 32) => |b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        (format, bits) => {
            return Err(Error::Audio(format!(
                "unsupported encoding: format {format}, {bits} bits per sample"
            )))
        }
    };

    let sample_bytes = usize::from(fmt.bits_per_sample / 8);
    let frame_bytes = sample_bytes * usize::from(fmt.channels);
    let samples = payload
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame.chunks_exact(sample_bytes).map(decode).sum();
            sum / f32::from(fmt.channels)
        })
        .collect();

    Ok(WavData { sample_rate_hz: fmt.sample_rate_hz, channels: fmt.channels, samples })
}

/// Read and decode a WAV file
pub fn read_wav(path: impl AsRef<Path>) -> Result<WavData> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Audio(format!("failed to read {}: {e}", path.display())))?;
    decode_wav(&bytes)
}

/// Encode mono samples as a 16-bit PCM WAV file
pub fn encode_wav_pcm16(samples: &[f32], sample_rate_hz: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate_hz.to_le_bytes());
    out.extend_from_slice(&(sample_rate_hz * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let q = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_stereo_wav(frames: &[(f32, f32)]) -> Vec<u8> {
        let data_len = (frames.len() * 8) as u32;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&FORMAT_IEEE_FLOAT.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&8000u32.to_le_bytes());
        wav.extend_from_slice(&(8000u32 * 8).to_le_bytes());
        wav.extend_from_slice(&8u16.to_le_bytes());
        wav.extend_from_slice(&32u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        for (l, r) in frames {
            wav.extend_from_slice(&l.to_le_bytes());
            wav.extend_from_slice(&r.to_le_bytes());
        }
        wav
    }

    #[test]
    fn test_pcm16_roundtrip() {
        let samples = vec![0.0, 0.5, -0.5, 0.25];
        let wav = decode_wav(&encode_wav_pcm16(&samples, 16000)).unwrap();
        assert_eq!(wav.sample_rate_hz, 16000);
        assert_eq!(wav.channels, 1);
        assert_eq!(wav.samples.len(), 4);
        for (a, b) in wav.samples.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_float_stereo_mixdown() {
        let wav = decode_wav(&float_stereo_wav(&[(1.0, 0.0), (0.5, -0.5)])).unwrap();
        assert_eq!(wav.samples, vec![0.5, 0.0]);
        assert!((wav.duration_secs() - 2.0 / 8000.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_non_riff() {
        assert!(matches!(decode_wav(b"not a wav file at all"), Err(Error::Audio(_))));
    }

    #[test]
    fn test_rejects_unsupported_depth() {
        let mut wav = encode_wav_pcm16(&[0.0; 4], 16000);
        // bits_per_sample lives at byte 34
        wav[34..36].copy_from_slice(&24u16.to_le_bytes());
        assert!(decode_wav(&wav).is_err());
    }

    #[test]
    fn test_read_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        std::fs::write(&path, encode_wav_pcm16(&[0.1; 160], 16000)).unwrap();
        let wav = read_wav(&path).unwrap();
        assert_eq!(wav.samples.len(), 160);
        assert!((wav.duration_secs() - 0.01).abs() < 1e-9);
    }
}
