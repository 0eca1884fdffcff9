//! Converted output frames

use std::fmt;

use rf_core::{AudioFormat, reverse_frames};

use crate::codec::PixelFormat;

/// Video frame in the reader's output format
#[derive(Clone)]
pub struct VideoFrame {
    /// Media time (ms)
    pub pos_ms: i64,
    /// Stream timestamp
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Bytes per row
    pub stride: usize,
}

impl VideoFrame {
    /// Bytes of the pixel at (x, y), empty when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        if x >= self.width || y >= self.height {
            return &[];
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride + x as usize * bpp;
        self.data.get(offset..offset + bpp).unwrap_or(&[])
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pos_ms", &self.pos_ms)
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// Converted audio of one decoded frame, kept in both directions
pub struct AudioPcm {
    pub format: AudioFormat,
    /// Interleaved samples in media order
    pub forward: Vec<u8>,
    /// Same samples with the frame order reversed
    pub backward: Vec<u8>,
}

impl AudioPcm {
    pub fn new(format: AudioFormat, forward: Vec<u8>) -> Self {
        let backward = reverse_frames(&forward, format.frame_size());
        Self {
            format,
            forward,
            backward,
        }
    }

    /// Number of sample frames
    pub fn frames(&self) -> usize {
        self.forward.len() / self.format.frame_size().max(1)
    }
}

impl fmt::Debug for AudioPcm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPcm")
            .field("format", &self.format)
            .field("frames", &self.frames())
            .finish()
    }
}
