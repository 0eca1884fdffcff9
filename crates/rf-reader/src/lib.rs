//! rf-reader: Cached media reading
//!
//! Video and audio readers for timeline playback and scrubbing:
//! - GOP-aligned decode tasks cached in a sliding window around the read position
//! - Forward and backward playback (backward audio comes pre-reversed)
//! - Three worker threads per reader (demux, decode, convert)
//! - Still images decode once, then the codec threads are released
//! - Pluggable codec backends: FFmpeg (feature "ffmpeg"), still images, synthetic streams

pub mod audio_reader;
pub mod cache_window;
pub mod codec;
pub mod config;
pub mod convert;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod gop_task;
pub mod image_source;
mod lifecycle;
mod pipeline;
pub mod scheduler;
pub mod seek_points;
pub mod synthetic;
pub mod video_reader;

pub use audio_reader::{AudioReadOutcome, AudioReader};
pub use cache_window::CacheWindow;
pub use codec::{
    AudioStreamInfo, CodecError, DecodedAudioFrame, DecodedVideoFrame, Decoder, Demuxer,
    MediaInfo, MediaSource, Packet, PixelFormat, VideoStreamInfo,
};
pub use config::{Interpolation, ReaderConfig, VideoOutputConfig};
pub use convert::{
    AudioConverter, FrameConverter, FrameConverterFactory, ImageFrameConverter, LinearResampler,
    Resampler, ResamplerFactory,
};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use frame::{AudioPcm, VideoFrame};
pub use image_source::ImageSource;
pub use lifecycle::ReaderStats;
pub use seek_points::SeekPointTable;
pub use video_reader::VideoReader;
