/// Linear PCM codec between hardware sample buffers and wire frames.
///
/// Wire format: 16-bit signed little-endian PCM, mono, one frame per
/// capture buffer.
///
/// Both directions use the same full-scale factor of 32768:
///   - encode: `round(clamp(x, -1, 1) * 32768)`, saturated to `i16`
///   - decode: `v / 32768`
///
/// so `decode(encode(x))` stays within one quantization step of `x`.

use std::time::Duration;
use tracing::debug;

/// Full-scale factor shared by encode and decode.
pub const FULL_SCALE: f32 = 32_768.0;

/// One quantization step in the float domain.
#[cfg(test)]
pub const QUANTUM: f32 = 1.0 / FULL_SCALE;

/// Sample rate / channel layout of a hardware buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    #[cfg(test)]
    pub const fn mono(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1 }
    }

    /// Wall-clock length of `frames` sample frames in this format.
    pub fn frame_duration(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((frames as f64) / (self.sample_rate as f64))
    }

    #[inline]
    fn channel_count(&self) -> usize {
        self.channels.max(1) as usize
    }
}

/// Interleaved samples as delivered by the capture hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    Float32(Vec<f32>),
    Int16(Vec<i16>),
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::Float32(s) => s.len(),
            SampleBuffer::Int16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Encode (capture → wire)
// ═══════════════════════════════════════════════════════════════════════

/// Quantize one float sample to `i16`.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    let scaled = (sample.clamp(-1.0, 1.0) * FULL_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a capture buffer into mono 16-bit LE wire bytes.
///
/// Integer buffers are copied without re-quantization.  Multi-channel
/// buffers are down-mixed by averaging each interleaved frame; a trailing
/// partial frame is dropped.
pub fn encode(buffer: &SampleBuffer, format: &AudioFormat) -> Vec<u8> {
    if buffer.is_empty() {
        debug!("pcm encode: empty capture buffer");
        return Vec::new();
    }

    let channels = format.channel_count();
    let mut out = Vec::with_capacity((buffer.len() / channels) * 2);

    match buffer {
        SampleBuffer::Int16(samples) if channels == 1 => {
            for s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleBuffer::Int16(samples) => {
            for frame in samples.chunks_exact(channels) {
                let sum: i32 = frame
                    .iter()
                    .map(|&s| s as i32)
                    .sum();
                let mixed = (sum / (channels as i32)) as i16;
                out.extend_from_slice(&mixed.to_le_bytes());
            }
        }
        SampleBuffer::Float32(samples) => {
            for frame in samples.chunks_exact(channels) {
                let mixed = frame.iter().sum::<f32>() / (channels as f32);
                out.extend_from_slice(&quantize(mixed).to_le_bytes());
            }
        }
    }

    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Decode (wire → playback)
// ═══════════════════════════════════════════════════════════════════════

/// Decode mono 16-bit LE wire bytes into interleaved float samples for the
/// playback format.  Each wire sample is repeated across all channels.
///
/// An odd trailing byte is a partial sample and is dropped.
pub fn decode(bytes: &[u8], format: &AudioFormat) -> Vec<f32> {
    if bytes.is_empty() {
        debug!("pcm decode: empty frame");
        return Vec::new();
    }
    if bytes.len() % 2 != 0 {
        debug!(len = bytes.len(), "pcm decode: odd-length frame, dropping trailing byte");
    }

    let channels = format.channel_count();
    let mut out = Vec::with_capacity((bytes.len() / 2) * channels);
    for chunk in bytes.chunks_exact(2) {
        let sample = (i16::from_le_bytes([chunk[0], chunk[1]]) as f32) / FULL_SCALE;
        for _ in 0..channels {
            out.push(sample);
        }
    }
    out
}

/// Root-mean-square level of a float buffer (0.0 for empty input).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    (sum_sq / (samples.len() as f64)).sqrt() as f32
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const MONO: AudioFormat = AudioFormat::mono(44_100);
    const STEREO: AudioFormat = AudioFormat { sample_rate: 48_000, channels: 2 };

    #[test]
    fn test_round_trip_within_one_quantum() {
        let n = 1024usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let t = (i as f32) / (n as f32);
                (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.9
            })
            .chain([1.0, -1.0, 0.0, 0.5, -0.5, QUANTUM, -QUANTUM])
            .collect();

        let wire = encode(&SampleBuffer::Float32(samples.clone()), &MONO);
        assert_eq!(wire.len(), samples.len() * 2);

        let back = decode(&wire, &MONO);
        assert_eq!(back.len(), samples.len());
        for (i, (a, b)) in samples.iter().zip(back.iter()).enumerate() {
            assert!((a - b).abs() <= QUANTUM + f32::EPSILON, "sample {} drifted: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_encode_clamps_full_scale() {
        let wire = encode(&SampleBuffer::Float32(vec![1.0, 1.5, -1.0, -3.0, f32::NAN]), &MONO);
        let values: Vec<i16> = wire
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MAX, i16::MIN, i16::MIN, 0]);
    }

    #[test]
    fn test_int16_copied_verbatim() {
        let samples = vec![i16::MIN, -1, 0, 1, 12_345, i16::MAX];
        let wire = encode(&SampleBuffer::Int16(samples.clone()), &MONO);
        let expected: Vec<u8> = samples
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_odd_length_drops_trailing_byte() {
        let mut wire = 1000i16.to_le_bytes().to_vec();
        wire.extend_from_slice(&(-1000i16).to_le_bytes());
        wire.push(0x7f);
        let out = decode(&wire, &MONO);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 1000.0 / FULL_SCALE).abs() < f32::EPSILON);
        assert!((out[1] + 1000.0 / FULL_SCALE).abs() < f32::EPSILON);

        assert!(decode(&[0x01], &MONO).is_empty());
    }

    #[test]
    fn test_empty_in_empty_out() {
        assert!(encode(&SampleBuffer::Float32(Vec::new()), &MONO).is_empty());
        assert!(encode(&SampleBuffer::Int16(Vec::new()), &MONO).is_empty());
        assert!(decode(&[], &MONO).is_empty());
    }

    #[test]
    fn test_stereo_capture_is_downmixed() {
        let wire = encode(&SampleBuffer::Float32(vec![0.5, -0.5, 0.25, 0.25, 0.9]), &STEREO);
        // two full frames; trailing partial frame dropped
        assert_eq!(wire.len(), 4);
        let back = decode(&wire, &MONO);
        assert!(back[0].abs() <= QUANTUM);
        assert!((back[1] - 0.25).abs() <= QUANTUM);

        let ints = encode(&SampleBuffer::Int16(vec![100, 300, -50, -150]), &STEREO);
        assert_eq!(ints, [200i16.to_le_bytes(), (-100i16).to_le_bytes()].concat());
    }

    #[test]
    fn test_decode_fans_out_to_playback_channels() {
        let wire = 16_384i16.to_le_bytes();
        let out = decode(&wire, &STEREO);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_frame_duration_matches_cadence() {
        let d = MONO.frame_duration(1024);
        assert!((d.as_secs_f64() - 1024.0 / 44_100.0).abs() < 1e-9);
        assert_eq!(AudioFormat::mono(0).frame_duration(1024), Duration::ZERO);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
