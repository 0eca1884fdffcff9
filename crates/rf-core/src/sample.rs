//! Sample formats and PCM buffer helpers

use serde::{Deserialize, Serialize};

use crate::{RfError, RfResult};

/// PCM sample encoding (always interleaved)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Decode the sample at `bytes[0..bytes_per_sample]` to f32 in [-1, 1]
    #[inline]
    pub fn read_f32(self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
            SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
            SampleFormat::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / 2_147_483_648.0
            }
            SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            SampleFormat::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(b) as f32
            }
        }
    }

    /// Encode `value` into `out[0..bytes_per_sample]`
    #[inline]
    pub fn write_f32(self, value: f32, out: &mut [u8]) {
        match self {
            SampleFormat::U8 => {
                out[0] = ((value.clamp(-1.0, 1.0) * 127.0) + 128.0).round() as u8;
            }
            SampleFormat::S16 => {
                let v = (value.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            SampleFormat::S32 => {
                let v = (value.clamp(-1.0, 1.0) as f64 * 2_147_483_647.0).round() as i32;
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
            SampleFormat::F32 => out[..4].copy_from_slice(&value.to_le_bytes()),
            SampleFormat::F64 => out[..8].copy_from_slice(&(value as f64).to_le_bytes()),
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::F32
    }
}

/// PCM layout of an audio stream or of requested output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(channels: u16, sample_rate: u32, sample_format: SampleFormat) -> Self {
        Self {
            channels,
            sample_rate,
            sample_format,
        }
    }

    /// Bytes of one interleaved frame (one sample per channel)
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    pub fn validate(&self) -> RfResult<()> {
        if self.channels == 0 {
            return Err(RfError::Config("audio format has zero channels".into()));
        }
        if self.sample_rate == 0 {
            return Err(RfError::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48000,
            sample_format: SampleFormat::F32,
        }
    }
}

/// Copy of `buf` with its interleaved frames in reverse order.
///
/// A trailing partial frame is dropped.
pub fn reverse_frames(buf: &[u8], frame_size: usize) -> Vec<u8> {
    if frame_size == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(buf.len() - buf.len() % frame_size);
    for frame in buf.chunks_exact(frame_size).rev() {
        out.extend_from_slice(frame);
    }
    out
}

/// Reverse the order of interleaved f32 frames in place
pub fn reverse_frames_in_place(samples: &mut [f32], channels: usize) {
    if channels == 0 {
        return;
    }
    let frames = samples.len() / channels;
    for i in 0..frames / 2 {
        let j = frames - 1 - i;
        for c in 0..channels {
            samples.swap(i * channels + c, j * channels + c);
        }
    }
}

/// Decode interleaved little-endian f32 bytes
pub fn f32_from_le_bytes(bytes: &[u8], out: &mut [f32]) -> usize {
    let n = (bytes.len() / 4).min(out.len());
    for (i, chunk) in bytes.chunks_exact(4).take(n).enumerate() {
        out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let fmt = AudioFormat::new(2, 48000, SampleFormat::S16);
        assert_eq!(fmt.frame_size(), 4);
        assert_eq!(AudioFormat::default().frame_size(), 8);
    }

    #[test]
    fn test_reverse_frames() {
        let buf = [1u8, 2, 3, 4, 5, 6, 7];
        assert_eq!(reverse_frames(&buf, 2), vec![5, 6, 3, 4, 1, 2]);

        let mut s = [0.0f32, 0.5, 1.0, 1.5, 2.0, 2.5];
        reverse_frames_in_place(&mut s, 2);
        assert_eq!(s, [2.0, 2.5, 1.0, 1.5, 0.0, 0.5]);
    }

    #[test]
    fn test_sample_conversion() {
        let mut out = [0u8; 2];
        SampleFormat::S16.write_f32(0.5, &mut out);
        let back = SampleFormat::S16.read_f32(&out);
        assert!((back - 0.5).abs() < 1e-4);

        assert!(AudioFormat::new(0, 48000, SampleFormat::F32).validate().is_err());
    }
}
