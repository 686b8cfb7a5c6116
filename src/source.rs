//! WAV input and conversion into whatever encoding a mode negotiated.

use playmode_output::{Encoding, PlaybackFormat};
use std::path::Path;
use wavers::Wav;

/// Decoded 16-bit interleaved PCM.
#[derive(Debug, Clone)]
pub struct PcmSource {
    pub rate: u32,
    pub channels: usize,
    pub samples: Vec<i16>,
}

impl PcmSource {
    pub fn open(path: &Path) -> Result<Self, String> {
        let mut wav = Wav::<i16>::from_path(path)
            .map_err(|e| format!("Failed to open WAV '{}': {e}", path.display()))?;
        let channels = wav.n_channels().max(1) as usize;
        let rate = wav.sample_rate().max(1) as u32;
        let samples: wavers::Samples<i16> = wav
            .read()
            .map_err(|e| format!("WAV read error '{}': {e}", path.display()))?;
        Ok(Self {
            rate,
            channels,
            samples: samples.to_vec(),
        })
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    /// Encodes frames `start..start + count` for `format`.
    pub fn encode(&self, start: usize, count: usize, format: &PlaybackFormat) -> Vec<u8> {
        let end = (start + count).min(self.frames());
        let start = start.min(end);
        let frames = &self.samples[start * self.channels..end * self.channels];
        encode_pcm(frames, self.channels, format)
    }
}

/// Converts interleaved 16-bit samples to `format`'s channel layout and
/// sample encoding. Stereo is averaged down to mono; mono is duplicated.
pub fn encode_pcm(samples: &[i16], channels: usize, format: &PlaybackFormat) -> Vec<u8> {
    let channels = channels.max(1);
    let out_channels = format.channels();
    let encoding = format.encoding;
    let mut out = Vec::with_capacity(samples.len() / channels * format.frame_bytes());
    for frame in samples.chunks_exact(channels) {
        if out_channels == 1 {
            let sum: i32 = frame.iter().map(|s| i32::from(*s)).sum();
            push_sample(&mut out, (sum / channels as i32) as i16, encoding);
        } else {
            let left = frame[0];
            let right = *frame.get(1).unwrap_or(&left);
            push_sample(&mut out, left, encoding);
            push_sample(&mut out, right, encoding);
        }
    }
    out
}

fn push_sample(out: &mut Vec<u8>, sample: i16, encoding: Encoding) {
    if encoding.contains(Encoding::ULAW) {
        out.push(linear_to_ulaw(sample));
        return;
    }
    if encoding.contains(Encoding::ALAW) {
        out.push(linear_to_alaw(sample));
        return;
    }
    let signed = encoding.contains(Encoding::SIGNED);
    let big = encoding.is_big_endian();
    match encoding.bit_depth() {
        24 => {
            let v = i32::from(sample) << 8;
            let v = if signed { v } else { v ^ 0x80_0000 };
            let bytes = v.to_le_bytes();
            if big {
                out.extend_from_slice(&[bytes[2], bytes[1], bytes[0]]);
            } else {
                out.extend_from_slice(&bytes[..3]);
            }
        }
        16 => {
            let v = if signed {
                sample as u16
            } else {
                (sample as u16) ^ 0x8000
            };
            if big {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        _ => {
            let v = (sample >> 8) as i8 as u8;
            out.push(if signed { v } else { v ^ 0x80 });
        }
    }
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut v = i32::from(sample);
    let sign = if v < 0 {
        v = -v;
        0x80
    } else {
        0
    };
    v = v.min(ULAW_CLIP) + ULAW_BIAS;
    // v >= ULAW_BIAS, so the shifted value is at least 1.
    let exponent = (31 - (v >> 7).leading_zeros()) as i32;
    let mantissa = (v >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut v = i32::from(sample) >> 3;
    let sign = if v >= 0 {
        0x80
    } else {
        v = -v - 1;
        0
    };
    let encoded = if v < 32 {
        (v >> 1) as u8
    } else {
        let exponent = (31 - v.leading_zeros()) as i32 - 4;
        let exponent = exponent.min(7);
        let mantissa = (v >> exponent) & 0x0F;
        ((exponent << 4) as u8) | mantissa as u8
    };
    (sign | encoded) ^ 0x55
}
