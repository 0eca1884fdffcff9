//! Codec collaborators
//!
//! The pipeline never talks to a container or codec library directly. A
//! [`MediaSource`] hands out a [`Demuxer`] and per-stream [`Decoder`]s that
//! follow the send/receive protocol of FFmpeg's codec API:
//!
//! - `send_packet(Some(..))` feeds input, `send_packet(None)` signals end of input
//! - `receive_frame()` yields frames until [`CodecError::Again`] (needs input)
//!   or [`CodecError::Eof`] (fully drained after end of input)
//! - `flush()` resets the decoder for a new, independent run

use std::fmt;

use thiserror::Error;

use rf_core::{AudioFormat, Rational, RfError, RfResult};

use crate::seek_points::SeekPointTable;

// ============ Errors ============

/// Result codes of demuxer and decoder calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Try again after the other side of the codec made progress
    #[error("resource temporarily unavailable")]
    Again,

    #[error("end of stream")]
    Eof,

    /// Corrupt input; the packet is skipped and decoding continues
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Anything else is fatal for the thread that hit it
    #[error("{0}")]
    Other(String),
}

impl From<CodecError> for RfError {
    fn from(e: CodecError) -> Self {
        RfError::Codec(e.to_string())
    }
}

// ============ Packets ============

/// One demuxed packet
#[derive(Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in stream time base units
    pub duration: i64,
    pub is_key: bool,
    pub data: Vec<u8>,
}

impl Packet {
    /// Best known timestamp, pts first
    #[inline]
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("stream_index", &self.stream_index)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("is_key", &self.is_key)
            .field("len", &self.data.len())
            .finish()
    }
}

// ============ Pixel Format ============

/// Packed pixel layouts understood by the built-in frame converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Bgr24,
    Bgra32,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Rgba32
    }
}

// ============ Decoded Frames ============

/// Timestamp accessor shared by decoded frame types
pub trait DecodedFrame: Send + 'static {
    fn pts(&self) -> Option<i64>;
}

/// Decoder output for a video stream
#[derive(Clone)]
pub struct DecodedVideoFrame {
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Bytes per row
    pub stride: usize,
}

impl DecodedFrame for DecodedVideoFrame {
    fn pts(&self) -> Option<i64> {
        self.pts
    }
}

impl fmt::Debug for DecodedVideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedVideoFrame")
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// Decoder output for an audio stream, interleaved
#[derive(Clone)]
pub struct DecodedAudioFrame {
    pub pts: Option<i64>,
    pub nb_samples: usize,
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

impl DecodedFrame for DecodedAudioFrame {
    fn pts(&self) -> Option<i64> {
        self.pts
    }
}

impl fmt::Debug for DecodedAudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedAudioFrame")
            .field("pts", &self.pts)
            .field("nb_samples", &self.nb_samples)
            .field("format", &self.format)
            .finish()
    }
}

// ============ Traits ============

/// Packet source for a whole container
pub trait Demuxer: Send {
    /// Position so that the next packet read is the key packet at or before `pts`
    fn seek(&mut self, stream_index: usize, pts: i64) -> Result<(), CodecError>;

    fn read_packet(&mut self) -> Result<Packet, CodecError>;
}

/// Packet-in, frame-out decoder
pub trait Decoder<F>: Send {
    /// `None` signals end of input
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError>;

    fn receive_frame(&mut self) -> Result<F, CodecError>;

    fn flush(&mut self);
}

pub type VideoDecoder = Box<dyn Decoder<DecodedVideoFrame>>;
pub type AudioDecoder = Box<dyn Decoder<DecodedAudioFrame>>;

// ============ Media Info ============

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    /// First presentation timestamp of the stream
    pub start_pts: i64,
    pub width: u32,
    pub height: u32,
    /// Frames per second as a ratio
    pub frame_rate: Rational,
}

#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    pub start_pts: i64,
    /// Format of decoded frames
    pub format: AudioFormat,
}

/// Media file metadata
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub url: String,
    pub duration_ms: i64,
    /// Still image (single frame, no duration)
    pub is_image: bool,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

/// An opened media file: metadata, seek table and codec factories
///
/// Each reader opens its own demuxer and decoder, so one source can feed
/// several readers concurrently.
pub trait MediaSource: Send + Sync {
    fn info(&self) -> &MediaInfo;

    /// Key-frame timestamps of the video stream
    fn seek_points(&self) -> SeekPointTable;

    fn open_demuxer(&self) -> RfResult<Box<dyn Demuxer>>;

    fn open_video_decoder(&self, prefer_hardware: bool) -> RfResult<VideoDecoder>;

    fn open_audio_decoder(&self) -> RfResult<AudioDecoder>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_timestamp_prefers_pts() {
        let mut pkt = Packet {
            pts: Some(10),
            dts: Some(5),
            ..Default::default()
        };
        assert_eq!(pkt.timestamp(), Some(10));
        pkt.pts = None;
        assert_eq!(pkt.timestamp(), Some(5));
    }

    #[test]
    fn test_codec_error_maps_to_rf_error() {
        let err: RfError = CodecError::InvalidData("bad nal".into()).into();
        assert!(matches!(err, RfError::Codec(msg) if msg.contains("bad nal")));
    }
}
