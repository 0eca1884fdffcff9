//! Still images as single-frame video sources
//!
//! The demuxer yields the encoded file as one key packet at pts 0; the
//! decoder runs it through the `image` crate.

use std::path::Path;
use std::sync::Arc;

use rf_core::{Rational, RfError, RfResult};

use crate::codec::{
    AudioDecoder, CodecError, DecodedVideoFrame, Decoder, Demuxer, MediaInfo, MediaSource, Packet,
    PixelFormat, VideoDecoder, VideoStreamInfo,
};
use crate::seek_points::SeekPointTable;

pub struct ImageSource {
    info: MediaInfo,
    bytes: Arc<Vec<u8>>,
}

impl ImageSource {
    pub fn open(path: impl AsRef<Path>) -> RfResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        Self::from_bytes(path.display().to_string(), bytes)
    }

    /// Probe an encoded image held in memory
    pub fn from_bytes(url: impl Into<String>, bytes: Vec<u8>) -> RfResult<Self> {
        let url = url.into();
        let (width, height) = image::ImageReader::new(std::io::Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| RfError::Codec(format!("{}: {}", url, e)))?
            .into_dimensions()
            .map_err(|e| RfError::Codec(format!("{}: {}", url, e)))?;
        log::debug!("image {} is {}x{}", url, width, height);

        let info = MediaInfo {
            url,
            duration_ms: 0,
            is_image: true,
            video: Some(VideoStreamInfo {
                index: 0,
                time_base: Rational::MILLIS,
                start_pts: 0,
                width,
                height,
                frame_rate: Rational::new(1, 1),
            }),
            audio: None,
        };
        Ok(Self {
            info,
            bytes: Arc::new(bytes),
        })
    }
}

impl MediaSource for ImageSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_points(&self) -> SeekPointTable {
        SeekPointTable::new(vec![0])
    }

    fn open_demuxer(&self) -> RfResult<Box<dyn Demuxer>> {
        Ok(Box::new(ImageDemuxer {
            bytes: self.bytes.clone(),
            emitted: false,
        }))
    }

    fn open_video_decoder(&self, _prefer_hardware: bool) -> RfResult<VideoDecoder> {
        Ok(Box::new(ImageDecoder::default()))
    }

    fn open_audio_decoder(&self) -> RfResult<AudioDecoder> {
        Err(RfError::InvalidArgument(format!("{} is a still image", self.info.url)))
    }
}

struct ImageDemuxer {
    bytes: Arc<Vec<u8>>,
    emitted: bool,
}

impl Demuxer for ImageDemuxer {
    fn seek(&mut self, _stream_index: usize, _pts: i64) -> Result<(), CodecError> {
        self.emitted = false;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        if self.emitted {
            return Err(CodecError::Eof);
        }
        self.emitted = true;
        Ok(Packet {
            stream_index: 0,
            pts: Some(0),
            dts: Some(0),
            duration: 1,
            is_key: true,
            data: self.bytes.as_ref().clone(),
        })
    }
}

#[derive(Default)]
struct ImageDecoder {
    frame: Option<DecodedVideoFrame>,
    input_eof: bool,
}

impl Decoder<DecodedVideoFrame> for ImageDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        let Some(packet) = packet else {
            self.input_eof = true;
            return Ok(());
        };
        if self.frame.is_some() {
            return Err(CodecError::Again);
        }
        let rgba = image::load_from_memory(&packet.data)
            .map_err(|e| CodecError::InvalidData(e.to_string()))?
            .to_rgba8();
        let (width, height) = rgba.dimensions();
        self.frame = Some(DecodedVideoFrame {
            pts: packet.pts,
            width,
            height,
            format: PixelFormat::Rgba32,
            data: rgba.into_raw(),
            stride: width as usize * 4,
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodedVideoFrame, CodecError> {
        match self.frame.take() {
            Some(frame) => Ok(frame),
            None if self.input_eof => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }

    fn flush(&mut self) {
        self.frame = None;
        self.input_eof = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_probe_dimensions() {
        let source = ImageSource::from_bytes("mem.png", png_bytes(7, 5, [1, 2, 3, 255])).unwrap();
        let info = source.info();
        assert!(info.is_image);
        assert_eq!(info.duration_ms, 0);
        let video = info.video.as_ref().unwrap();
        assert_eq!((video.width, video.height), (7, 5));
        assert_eq!(source.seek_points().points(), &[0]);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ImageSource::from_bytes("junk", vec![0, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_single_packet_decodes() {
        let source = ImageSource::from_bytes("mem.png", png_bytes(2, 2, [9, 8, 7, 255])).unwrap();
        let mut demuxer = source.open_demuxer().unwrap();
        let mut decoder = source.open_video_decoder(false).unwrap();

        let packet = demuxer.read_packet().unwrap();
        assert!(matches!(demuxer.read_packet(), Err(CodecError::Eof)));
        decoder.send_packet(Some(&packet)).unwrap();
        decoder.send_packet(None).unwrap();
        let frame = decoder.receive_frame().unwrap();
        assert_eq!(frame.format, PixelFormat::Rgba32);
        assert_eq!(&frame.data[..4], &[9, 8, 7, 255]);
        assert!(matches!(decoder.receive_frame(), Err(CodecError::Eof)));
    }

    #[test]
    fn test_open_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        std::fs::write(&path, png_bytes(3, 4, [0, 0, 0, 255])).unwrap();
        let source = ImageSource::open(&path).unwrap();
        assert_eq!(source.info().video.as_ref().unwrap().height, 4);
    }
}
