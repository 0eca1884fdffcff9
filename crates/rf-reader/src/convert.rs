//! Frame conversion
//!
//! Video: [`FrameConverter`] turns decoded pictures into the requested output
//! size and pixel format. The built-in [`ImageFrameConverter`] handles packed
//! RGB/BGR/gray input with the `image` crate's resize filters.
//!
//! Audio: [`AudioConverter`] passes frames through untouched when the decoded
//! format already matches the output and otherwise runs a [`Resampler`].

use image::RgbaImage;
use image::imageops::{self, FilterType};

use rf_core::{AudioFormat, RfError, RfResult};

use crate::codec::{DecodedAudioFrame, DecodedVideoFrame, PixelFormat};
use crate::config::{Interpolation, VideoOutputConfig};
use crate::frame::VideoFrame;

// ============ Video ============

pub trait FrameConverter: Send {
    fn set_output(&mut self, output: VideoOutputConfig) -> RfResult<()>;

    /// `timestamp` is the frame's media time in seconds
    fn convert(&mut self, frame: &DecodedVideoFrame, timestamp: f64) -> RfResult<VideoFrame>;
}

/// Factory for per-pipeline converters; each convert thread owns one
pub type FrameConverterFactory =
    std::sync::Arc<dyn Fn() -> Box<dyn FrameConverter> + Send + Sync>;

fn filter_type(interpolation: Interpolation) -> FilterType {
    match interpolation {
        Interpolation::Nearest => FilterType::Nearest,
        Interpolation::Bilinear => FilterType::Triangle,
        Interpolation::Bicubic => FilterType::CatmullRom,
        Interpolation::Lanczos => FilterType::Lanczos3,
    }
}

/// Converter for packed pixel formats
#[derive(Debug, Default)]
pub struct ImageFrameConverter {
    output: VideoOutputConfig,
}

impl ImageFrameConverter {
    pub fn new(output: VideoOutputConfig) -> Self {
        Self { output }
    }

    fn to_rgba(frame: &DecodedVideoFrame) -> RfResult<RgbaImage> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let bpp = frame.format.bytes_per_pixel();
        let row_len = w * bpp;
        if w == 0 || h == 0 {
            return Err(RfError::Codec("empty video frame".into()));
        }
        if frame.stride < row_len || frame.data.len() < frame.stride * (h - 1) + row_len {
            return Err(RfError::Codec(format!(
                "video frame buffer too small: {} bytes for {}x{} stride {}",
                frame.data.len(),
                w,
                h,
                frame.stride
            )));
        }

        let mut rgba = Vec::with_capacity(w * h * 4);
        for row in 0..h {
            let line = &frame.data[row * frame.stride..row * frame.stride + row_len];
            for px in line.chunks_exact(bpp) {
                let out = match frame.format {
                    PixelFormat::Rgb24 => [px[0], px[1], px[2], 255],
                    PixelFormat::Rgba32 => [px[0], px[1], px[2], px[3]],
                    PixelFormat::Bgr24 => [px[2], px[1], px[0], 255],
                    PixelFormat::Bgra32 => [px[2], px[1], px[0], px[3]],
                    PixelFormat::Gray8 => [px[0], px[0], px[0], 255],
                };
                rgba.extend_from_slice(&out);
            }
        }
        RgbaImage::from_raw(frame.width, frame.height, rgba)
            .ok_or_else(|| RfError::Codec("pixel buffer size mismatch".into()))
    }

    fn pack(image: &RgbaImage, format: PixelFormat) -> Vec<u8> {
        if format == PixelFormat::Rgba32 {
            return image.as_raw().clone();
        }
        let mut out = Vec::with_capacity(image.width() as usize * image.height() as usize * format.bytes_per_pixel());
        for px in image.pixels() {
            let [r, g, b, a] = px.0;
            match format {
                PixelFormat::Rgb24 => out.extend_from_slice(&[r, g, b]),
                PixelFormat::Rgba32 => out.extend_from_slice(&[r, g, b, a]),
                PixelFormat::Bgr24 => out.extend_from_slice(&[b, g, r]),
                PixelFormat::Bgra32 => out.extend_from_slice(&[b, g, r, a]),
                PixelFormat::Gray8 => {
                    let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
                    out.push(luma as u8);
                }
            }
        }
        out
    }
}

impl FrameConverter for ImageFrameConverter {
    fn set_output(&mut self, output: VideoOutputConfig) -> RfResult<()> {
        self.output = output;
        Ok(())
    }

    fn convert(&mut self, frame: &DecodedVideoFrame, timestamp: f64) -> RfResult<VideoFrame> {
        let rgba = Self::to_rgba(frame)?;
        let (w, h) = self.output.resolve_size(frame.width, frame.height);
        let image = if (w, h) != (frame.width, frame.height) {
            imageops::resize(&rgba, w, h, filter_type(self.output.interpolation))
        } else {
            rgba
        };

        let format = self.output.format;
        Ok(VideoFrame {
            pos_ms: (timestamp * 1000.0).round() as i64,
            pts: frame.pts.unwrap_or(0),
            width: w,
            height: h,
            format,
            data: Self::pack(&image, format),
            stride: w as usize * format.bytes_per_pixel(),
        })
    }
}

// ============ Audio ============

pub trait Resampler: Send {
    /// Convert interleaved `input` from one PCM layout to another
    fn convert(&mut self, input: &[u8], from: AudioFormat, to: AudioFormat) -> RfResult<Vec<u8>>;
}

pub type ResamplerFactory = std::sync::Arc<dyn Fn() -> Box<dyn Resampler> + Send + Sync>;

/// Linear-interpolation resampler with simple channel mapping
///
/// Mono is duplicated to every output channel; more channels than the
/// output has are averaged down to mono or dropped.
#[derive(Debug, Default, Clone)]
pub struct LinearResampler;

impl LinearResampler {
    pub fn new() -> Self {
        Self
    }

    fn map_channels(input: &[f32], in_ch: usize, out_ch: usize) -> Vec<f32> {
        if in_ch == out_ch {
            return input.to_vec();
        }
        let frames = input.len() / in_ch;
        let mut out = Vec::with_capacity(frames * out_ch);
        for frame in input.chunks_exact(in_ch) {
            if in_ch == 1 {
                out.extend(std::iter::repeat_n(frame[0], out_ch));
            } else if out_ch == 1 {
                out.push(frame.iter().sum::<f32>() / in_ch as f32);
            } else {
                for c in 0..out_ch {
                    out.push(frame.get(c).copied().unwrap_or(0.0));
                }
            }
        }
        out
    }
}

impl Resampler for LinearResampler {
    fn convert(&mut self, input: &[u8], from: AudioFormat, to: AudioFormat) -> RfResult<Vec<u8>> {
        from.validate()?;
        to.validate()?;

        let in_bps = from.sample_format.bytes_per_sample();
        let samples: Vec<f32> = input
            .chunks_exact(in_bps)
            .map(|b| from.sample_format.read_f32(b))
            .collect();
        let out_ch = to.channels as usize;
        let mapped = Self::map_channels(&samples, from.channels as usize, out_ch);

        let in_frames = mapped.len() / out_ch;
        let resampled = if from.sample_rate == to.sample_rate || in_frames == 0 {
            mapped
        } else {
            let ratio = from.sample_rate as f64 / to.sample_rate as f64;
            let out_frames = (in_frames as f64 / ratio).round() as usize;
            let mut out = Vec::with_capacity(out_frames * out_ch);
            for i in 0..out_frames {
                let src = i as f64 * ratio;
                let i0 = (src.floor() as usize).min(in_frames - 1);
                let i1 = (i0 + 1).min(in_frames - 1);
                let frac = (src - i0 as f64) as f32;
                for c in 0..out_ch {
                    let a = mapped[i0 * out_ch + c];
                    let b = mapped[i1 * out_ch + c];
                    out.push(a + (b - a) * frac);
                }
            }
            out
        };

        let out_bps = to.sample_format.bytes_per_sample();
        let mut bytes = vec![0u8; resampled.len() * out_bps];
        for (value, chunk) in resampled.iter().zip(bytes.chunks_exact_mut(out_bps)) {
            to.sample_format.write_f32(*value, chunk);
        }
        Ok(bytes)
    }
}

/// Decoded audio frame to output PCM
pub struct AudioConverter {
    output: AudioFormat,
    resampler: Box<dyn Resampler>,
}

impl AudioConverter {
    pub fn new(output: AudioFormat, resampler: Box<dyn Resampler>) -> Self {
        Self { output, resampler }
    }

    pub fn output(&self) -> AudioFormat {
        self.output
    }

    /// Whether frames in `format` pass through without resampling
    pub fn is_pass_through(&self, format: AudioFormat) -> bool {
        format == self.output
    }

    pub fn convert(&mut self, frame: DecodedAudioFrame) -> RfResult<Vec<u8>> {
        if self.is_pass_through(frame.format) {
            return Ok(frame.data);
        }
        self.resampler.convert(&frame.data, frame.format, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::SampleFormat;

    fn solid(width: u32, height: u32, format: PixelFormat, px: &[u8]) -> DecodedVideoFrame {
        let mut data = Vec::new();
        for _ in 0..width * height {
            data.extend_from_slice(px);
        }
        DecodedVideoFrame {
            pts: Some(3600),
            width,
            height,
            format,
            data,
            stride: width as usize * format.bytes_per_pixel(),
        }
    }

    #[test]
    fn test_convert_swaps_channels() {
        let mut conv = ImageFrameConverter::new(VideoOutputConfig::new(0, 0, PixelFormat::Bgra32));
        let frame = conv
            .convert(&solid(4, 2, PixelFormat::Rgb24, &[10, 20, 30]), 0.04)
            .unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.pos_ms, 40);
        assert_eq!(frame.pixel(3, 1), &[30, 20, 10, 255]);
    }

    #[test]
    fn test_convert_resizes() {
        let mut conv = ImageFrameConverter::default();
        conv.set_output(VideoOutputConfig::new(8, 0, PixelFormat::Rgb24))
            .unwrap();
        let frame = conv
            .convert(&solid(16, 8, PixelFormat::Gray8, &[200]), 0.0)
            .unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.data.len(), 8 * 4 * 3);
        assert_eq!(frame.pixel(0, 0), &[200, 200, 200]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut conv = ImageFrameConverter::default();
        let mut frame = solid(4, 4, PixelFormat::Rgba32, &[0, 0, 0, 0]);
        frame.data.truncate(10);
        assert!(conv.convert(&frame, 0.0).is_err());
    }

    #[test]
    fn test_pass_through() {
        let fmt = AudioFormat::new(2, 48000, SampleFormat::F32);
        let mut conv = AudioConverter::new(fmt, Box::new(LinearResampler::new()));
        let frame = DecodedAudioFrame {
            pts: Some(0),
            nb_samples: 2,
            format: fmt,
            data: vec![1; 16],
        };
        assert_eq!(conv.convert(frame).unwrap(), vec![1; 16]);
    }

    #[test]
    fn test_resample_rate_and_layout() {
        let from = AudioFormat::new(1, 24000, SampleFormat::F32);
        let to = AudioFormat::new(2, 48000, SampleFormat::S16);
        let input: Vec<u8> = (0..100)
            .flat_map(|i| (i as f32 / 100.0).to_le_bytes())
            .collect();
        let out = LinearResampler::new().convert(&input, from, to).unwrap();
        // 100 mono frames at 24k -> 200 stereo S16 frames
        assert_eq!(out.len(), 200 * 2 * 2);
        let left = SampleFormat::S16.read_f32(&out[40 * 4..]);
        let right = SampleFormat::S16.read_f32(&out[40 * 4 + 2..]);
        assert!((left - 0.2).abs() < 1e-3);
        assert_eq!(left, right);
    }
}
