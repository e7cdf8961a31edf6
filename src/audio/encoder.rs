//! Capture frame → transport packet encoding
//!
//! Pure transform, no buffering: each `AudioFrame` becomes exactly one
//! `OutboundPacket` of base64-encoded 16 kHz mono PCM16 (little-endian).

use base64::{engine::general_purpose::STANDARD, Engine};

use super::capture::AudioFrame;

/// Sample rate the remote service expects for input audio
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Describes the PCM payload carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// MIME type announced to the remote service, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Encoded audio ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    /// Base64 of little-endian PCM16 samples
    pub data: String,
    pub format: AudioFormat,
    /// Number of samples encoded in `data`
    pub sample_count: usize,
}

/// Stateless converter from capture frames to outbound packets
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    target_rate: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            target_rate: TARGET_SAMPLE_RATE,
        }
    }
}

impl FrameEncoder {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    pub fn encode(&self, frame: &AudioFrame) -> OutboundPacket {
        let mono = downmix(&frame.samples, frame.channels);
        let resampled = resample(&mono, frame.sample_rate, self.target_rate);
        let pcm = to_pcm16(&resampled);

        OutboundPacket {
            data: STANDARD.encode(pcm16_to_bytes(&pcm)),
            format: AudioFormat {
                sample_rate: self.target_rate,
                channels: 1,
            },
            sample_count: pcm.len(),
        }
    }
}

/// Convert float samples to PCM16, clamping instead of wrapping
///
/// Full scale maps to 32768 so that -1.0 lands exactly on `i16::MIN`;
/// +1.0 and anything louder clamps to `i16::MAX`.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let scaled = if s.is_nan() { 0.0 } else { s * 32768.0 };
            scaled.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

/// Resample mono audio from `source_rate` to `target_rate`
///
/// Integer downsampling ratios (48k → 16k) average each group of samples;
/// any other ratio falls back to linear interpolation.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = match (samples.get(idx), samples.get(idx + 1)) {
            (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
            (Some(&a), None) => a,
            _ => 0.0,
        };
        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>, sample_rate: u32, channels: u16) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate,
            channels,
        }
    }

    #[test]
    fn test_to_pcm16_clamps_instead_of_wrapping() {
        let pcm = to_pcm16(&[0.0, 1.0, -1.0, 2.5, -3.0, 0.5]);
        assert_eq!(pcm, vec![0, i16::MAX, i16::MIN, i16::MAX, i16::MIN, 16384]);
    }

    #[test]
    fn test_to_pcm16_nan_is_silence() {
        assert_eq!(to_pcm16(&[f32::NAN]), vec![0]);
    }

    #[test]
    fn test_bytes_are_little_endian() {
        assert_eq!(pcm16_to_bytes(&[0x1234, 0x5678]), vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.5, -0.5, 0.2, 0.4], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.0).abs() < 1e-6);
        assert!((mono[1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_resample_integer_ratio_averages() {
        let out = resample(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 48_000, 16_000);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_non_integer_ratio_interpolates() {
        let input = vec![0.25_f32; 441];
        let out = resample(&input, 44_100, 16_000);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resample_zero_rate_returns_original() {
        let input = vec![0.1, 0.2];
        assert_eq!(resample(&input, 0, 16_000), input);
        assert_eq!(resample(&input, 48_000, 0), input);
    }

    #[test]
    fn test_encode_produces_16k_mono_packet() {
        let encoder = FrameEncoder::default();
        let packet = encoder.encode(&frame(vec![0.5; 4800 * 2], 48_000, 2));

        assert_eq!(packet.format.sample_rate, 16_000);
        assert_eq!(packet.format.channels, 1);
        assert_eq!(packet.format.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(packet.sample_count, 1600);

        let bytes = STANDARD.decode(&packet.data).unwrap();
        assert_eq!(bytes.len(), 3200);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16384);
    }

    #[test]
    fn test_encode_empty_frame() {
        let packet = FrameEncoder::default().encode(&frame(Vec::new(), 16_000, 1));
        assert_eq!(packet.sample_count, 0);
        assert!(packet.data.is_empty());
    }
}
