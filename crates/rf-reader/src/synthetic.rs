//! Synthetic media sources
//!
//! Deterministic in-memory streams that speak the same demuxer/decoder
//! protocol as a real codec backend: decoder latency, `Again` back-pressure,
//! corrupt packets and hard failures can all be configured. Used by the
//! tests and by tooling that needs media without files.

use std::collections::VecDeque;

use rf_core::{AudioFormat, Rational, RfResult, SampleFormat, ms_to_samples, pts_to_ms};

use crate::codec::{
    AudioDecoder, AudioStreamInfo, CodecError, DecodedAudioFrame, DecodedVideoFrame, Decoder,
    Demuxer, MediaInfo, MediaSource, Packet, PixelFormat, VideoDecoder, VideoStreamInfo,
};
use crate::seek_points::SeekPointTable;

const CORRUPT_MARKER: &[u8] = b"corrupt";

// ============ Video ============

#[derive(Debug, Clone)]
pub struct SyntheticVideoConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    pub start_pts: i64,
    pub frame_rate: Rational,
    pub frame_count: u64,
    /// Frames per GOP; every GOP starts with a key frame
    pub gop_size: u64,
    /// Frames the decoder holds back before emitting output
    pub decoder_delay: usize,
    /// Wall-clock time spent on each decoded frame (ms)
    pub decode_time_ms: u64,
    /// Frame indices whose packets fail to decode
    pub corrupt_frames: Vec<u64>,
    /// Frame index at which the decoder fails for good
    pub fail_at_frame: Option<u64>,
    /// Leave the last GOP out of the seek table
    pub drop_last_seek_point: bool,
}

impl Default for SyntheticVideoConfig {
    fn default() -> Self {
        Self {
            url: "synthetic://video".into(),
            width: 32,
            height: 18,
            time_base: Rational::new(1, 90_000),
            start_pts: 0,
            frame_rate: Rational::new(25, 1),
            frame_count: 250,
            gop_size: 12,
            decoder_delay: 2,
            decode_time_ms: 0,
            corrupt_frames: Vec::new(),
            fail_at_frame: None,
            drop_last_seek_point: false,
        }
    }
}

impl SyntheticVideoConfig {
    /// Frame duration in stream time base units
    pub fn frame_duration(&self) -> i64 {
        // (1 / fps) expressed in time base units
        let num = self.time_base.den * self.frame_rate.den;
        let den = self.time_base.num * self.frame_rate.num;
        if den == 0 { 1 } else { (num / den).max(1) }
    }

    pub fn frame_pts(&self, index: u64) -> i64 {
        self.start_pts + index as i64 * self.frame_duration()
    }

    /// Media time of a frame, relative to the stream start
    pub fn frame_ms(&self, index: u64) -> i64 {
        pts_to_ms(index as i64 * self.frame_duration(), self.time_base)
    }

    pub fn duration_ms(&self) -> i64 {
        self.frame_ms(self.frame_count)
    }
}

/// Color of a synthetic frame, as produced by its decoder
pub fn synthetic_frame_color(index: u64) -> [u8; 3] {
    let hue = (index * 10 % 360) as f32;
    let (r, g, b) = hsv_to_rgb(hue, 0.5, 0.6);
    [r, g, b]
}

/// Frame index stamped into pixel (0, 0) of a decoded synthetic frame
pub fn synthetic_frame_index(pixel: &[u8]) -> u64 {
    match pixel {
        [b0, b1, b2, ..] => *b0 as u64 | (*b1 as u64) << 8 | (*b2 as u64) << 16,
        _ => 0,
    }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}

pub struct SyntheticVideoSource {
    config: SyntheticVideoConfig,
    info: MediaInfo,
}

impl SyntheticVideoSource {
    pub fn new(config: SyntheticVideoConfig) -> Self {
        let info = MediaInfo {
            url: config.url.clone(),
            duration_ms: config.duration_ms(),
            is_image: false,
            video: Some(VideoStreamInfo {
                index: 0,
                time_base: config.time_base,
                start_pts: config.start_pts,
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
            }),
            audio: None,
        };
        Self { config, info }
    }

    pub fn config(&self) -> &SyntheticVideoConfig {
        &self.config
    }
}

impl MediaSource for SyntheticVideoSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_points(&self) -> SeekPointTable {
        let gop = self.config.gop_size.max(1);
        let mut points: Vec<i64> = (0..self.config.frame_count)
            .step_by(gop as usize)
            .map(|i| self.config.frame_pts(i))
            .collect();
        if self.config.drop_last_seek_point && points.len() > 1 {
            points.pop();
        }
        SeekPointTable::new(points)
    }

    fn open_demuxer(&self) -> RfResult<Box<dyn Demuxer>> {
        Ok(Box::new(SyntheticVideoDemuxer {
            config: self.config.clone(),
            next: 0,
        }))
    }

    fn open_video_decoder(&self, prefer_hardware: bool) -> RfResult<VideoDecoder> {
        if prefer_hardware {
            log::debug!("synthetic source has no hardware decoder, using software");
        }
        Ok(Box::new(SyntheticVideoDecoder {
            config: self.config.clone(),
            queue: VecDeque::new(),
            input_eof: false,
        }))
    }

    fn open_audio_decoder(&self) -> RfResult<AudioDecoder> {
        Err(rf_core::RfError::InvalidArgument(format!(
            "{} has no audio stream",
            self.config.url
        )))
    }
}

struct SyntheticVideoDemuxer {
    config: SyntheticVideoConfig,
    next: u64,
}

impl Demuxer for SyntheticVideoDemuxer {
    fn seek(&mut self, _stream_index: usize, pts: i64) -> Result<(), CodecError> {
        let gop = self.config.gop_size.max(1);
        let frame = ((pts - self.config.start_pts).max(0) / self.config.frame_duration()) as u64;
        self.next = (frame / gop * gop).min(self.config.frame_count);
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        if self.next >= self.config.frame_count {
            return Err(CodecError::Eof);
        }
        let index = self.next;
        self.next += 1;

        let data = if self.config.corrupt_frames.contains(&index) {
            CORRUPT_MARKER.to_vec()
        } else {
            index.to_le_bytes().to_vec()
        };
        let pts = self.config.frame_pts(index);
        Ok(Packet {
            stream_index: 0,
            pts: Some(pts),
            dts: Some(pts),
            duration: self.config.frame_duration(),
            is_key: index % self.config.gop_size.max(1) == 0,
            data,
        })
    }
}

struct SyntheticVideoDecoder {
    config: SyntheticVideoConfig,
    queue: VecDeque<u64>,
    input_eof: bool,
}

impl SyntheticVideoDecoder {
    fn render(&self, index: u64) -> DecodedVideoFrame {
        let (w, h) = (self.config.width, self.config.height);
        let [r, g, b] = synthetic_frame_color(index);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for _ in 0..(w * h) {
            data.extend_from_slice(&[r, g, b]);
        }
        if data.len() >= 3 {
            data[0] = (index & 0xff) as u8;
            data[1] = ((index >> 8) & 0xff) as u8;
            data[2] = ((index >> 16) & 0xff) as u8;
        }
        DecodedVideoFrame {
            pts: Some(self.config.frame_pts(index)),
            width: w,
            height: h,
            format: PixelFormat::Rgb24,
            data,
            stride: (w * 3) as usize,
        }
    }
}

impl Decoder<DecodedVideoFrame> for SyntheticVideoDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        if self.input_eof {
            return Err(CodecError::Eof);
        }
        let Some(packet) = packet else {
            self.input_eof = true;
            return Ok(());
        };
        if self.queue.len() > self.config.decoder_delay + 1 {
            return Err(CodecError::Again);
        }
        let bytes: [u8; 8] = packet
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::InvalidData(format!("bad packet at {:?}", packet.pts)))?;
        let index = u64::from_le_bytes(bytes);
        if self.config.fail_at_frame == Some(index) {
            return Err(CodecError::Other(format!("decoder failure at frame {}", index)));
        }
        self.queue.push_back(index);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodedVideoFrame, CodecError> {
        let ready = self.queue.len() > self.config.decoder_delay || (self.input_eof && !self.queue.is_empty());
        if ready && let Some(index) = self.queue.pop_front() {
            if self.config.decode_time_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(self.config.decode_time_ms));
            }
            return Ok(self.render(index));
        }
        if self.input_eof {
            Err(CodecError::Eof)
        } else {
            Err(CodecError::Again)
        }
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.input_eof = false;
    }
}

// ============ Audio ============

#[derive(Debug, Clone)]
pub struct SyntheticAudioConfig {
    pub url: String,
    /// Decoded format; the stream time base is one sample
    pub format: AudioFormat,
    pub duration_ms: i64,
    /// Samples per packet
    pub packet_frames: usize,
    /// Packet indices that fail to decode
    pub corrupt_packets: Vec<u64>,
}

impl Default for SyntheticAudioConfig {
    fn default() -> Self {
        Self {
            url: "synthetic://audio".into(),
            format: AudioFormat::new(2, 48_000, SampleFormat::F32),
            duration_ms: 5_000,
            packet_frames: 1024,
            corrupt_packets: Vec::new(),
        }
    }
}

impl SyntheticAudioConfig {
    pub fn total_frames(&self) -> i64 {
        ms_to_samples(self.duration_ms, self.format.sample_rate)
    }

    pub fn time_base(&self) -> Rational {
        Rational::per_sample(self.format.sample_rate)
    }
}

/// Value of sample `frame` on `channel`; a sawtooth with a 100 ms period,
/// inverted and halved on odd channels
pub fn synthetic_sample(frame: i64, channel: u16) -> f32 {
    let phase = frame.rem_euclid(4800) as f32 / 4800.0;
    let value = phase - 0.5;
    if channel % 2 == 0 { value } else { -0.5 * value }
}

pub struct SyntheticAudioSource {
    config: SyntheticAudioConfig,
    info: MediaInfo,
}

impl SyntheticAudioSource {
    pub fn new(config: SyntheticAudioConfig) -> Self {
        let info = MediaInfo {
            url: config.url.clone(),
            duration_ms: config.duration_ms,
            is_image: false,
            video: None,
            audio: Some(AudioStreamInfo {
                index: 0,
                time_base: config.time_base(),
                start_pts: 0,
                format: config.format,
            }),
        };
        Self { config, info }
    }

    pub fn config(&self) -> &SyntheticAudioConfig {
        &self.config
    }
}

impl MediaSource for SyntheticAudioSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_points(&self) -> SeekPointTable {
        // every audio packet is a key packet
        SeekPointTable::new(vec![0])
    }

    fn open_demuxer(&self) -> RfResult<Box<dyn Demuxer>> {
        Ok(Box::new(SyntheticAudioDemuxer {
            config: self.config.clone(),
            next: 0,
        }))
    }

    fn open_video_decoder(&self, _prefer_hardware: bool) -> RfResult<VideoDecoder> {
        Err(rf_core::RfError::InvalidArgument(format!(
            "{} has no video stream",
            self.config.url
        )))
    }

    fn open_audio_decoder(&self) -> RfResult<AudioDecoder> {
        Ok(Box::new(SyntheticAudioDecoder {
            format: self.config.format,
            queue: VecDeque::new(),
            input_eof: false,
        }))
    }
}

struct SyntheticAudioDemuxer {
    config: SyntheticAudioConfig,
    /// Next packet index
    next: u64,
}

impl Demuxer for SyntheticAudioDemuxer {
    fn seek(&mut self, _stream_index: usize, pts: i64) -> Result<(), CodecError> {
        let per_packet = self.config.packet_frames.max(1) as i64;
        self.next = (pts.max(0) / per_packet) as u64;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        let per_packet = self.config.packet_frames.max(1) as i64;
        let start = self.next as i64 * per_packet;
        let total = self.config.total_frames();
        if start >= total {
            return Err(CodecError::Eof);
        }
        let index = self.next;
        self.next += 1;

        let frames = per_packet.min(total - start);
        let mut data = Vec::with_capacity(16);
        if self.config.corrupt_packets.contains(&index) {
            data.extend_from_slice(CORRUPT_MARKER);
        } else {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&frames.to_le_bytes());
        }
        Ok(Packet {
            stream_index: 0,
            pts: Some(start),
            dts: Some(start),
            duration: frames,
            is_key: true,
            data,
        })
    }
}

struct SyntheticAudioDecoder {
    format: AudioFormat,
    queue: VecDeque<(i64, i64)>,
    input_eof: bool,
}

impl SyntheticAudioDecoder {
    fn render(&self, start: i64, frames: i64) -> DecodedAudioFrame {
        let fmt = self.format;
        let bps = fmt.sample_format.bytes_per_sample();
        let mut data = vec![0u8; frames as usize * fmt.frame_size()];
        for (i, frame) in data.chunks_exact_mut(fmt.frame_size()).enumerate() {
            for (ch, sample) in frame.chunks_exact_mut(bps).enumerate() {
                let value = synthetic_sample(start + i as i64, ch as u16);
                fmt.sample_format.write_f32(value, sample);
            }
        }
        DecodedAudioFrame {
            pts: Some(start),
            nb_samples: frames as usize,
            format: fmt,
            data,
        }
    }
}

impl Decoder<DecodedAudioFrame> for SyntheticAudioDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        if self.input_eof {
            return Err(CodecError::Eof);
        }
        let Some(packet) = packet else {
            self.input_eof = true;
            return Ok(());
        };
        if self.queue.len() > 1 {
            return Err(CodecError::Again);
        }
        let field = |at: usize| -> Option<i64> {
            let bytes: [u8; 8] = packet.data.get(at..at + 8)?.try_into().ok()?;
            Some(i64::from_le_bytes(bytes))
        };
        match (field(0), field(8)) {
            (Some(start), Some(frames)) if packet.data.len() == 16 => {
                self.queue.push_back((start, frames));
                Ok(())
            }
            _ => Err(CodecError::InvalidData(format!("bad audio packet at {:?}", packet.pts))),
        }
    }

    fn receive_frame(&mut self) -> Result<DecodedAudioFrame, CodecError> {
        match self.queue.pop_front() {
            Some((start, frames)) => Ok(self.render(start, frames)),
            None if self.input_eof => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.input_eof = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_timing() {
        let config = SyntheticVideoConfig::default();
        assert_eq!(config.frame_duration(), 3600);
        assert_eq!(config.frame_ms(30), 1200);
        assert_eq!(config.duration_ms(), 10_000);
    }

    #[test]
    fn test_video_seek_points_are_gop_starts() {
        let source = SyntheticVideoSource::new(SyntheticVideoConfig::default());
        let table = source.seek_points();
        assert_eq!(table.first(), Some(0));
        assert_eq!(table.points()[1], 12 * 3600);
        assert_eq!(table.len(), 21);
    }

    #[test]
    fn test_demuxer_seeks_to_key_frame() {
        let source = SyntheticVideoSource::new(SyntheticVideoConfig::default());
        let mut demuxer = source.open_demuxer().unwrap();
        demuxer.seek(0, 15 * 3600).unwrap();
        let packet = demuxer.read_packet().unwrap();
        assert_eq!(packet.pts, Some(12 * 3600));
        assert!(packet.is_key);
    }

    #[test]
    fn test_decoder_delay_and_drain() {
        let source = SyntheticVideoSource::new(SyntheticVideoConfig::default());
        let mut demuxer = source.open_demuxer().unwrap();
        let mut decoder = source.open_video_decoder(false).unwrap();

        let first = demuxer.read_packet().unwrap();
        decoder.send_packet(Some(&first)).unwrap();
        assert_eq!(decoder.receive_frame().unwrap_err(), CodecError::Again);

        decoder.send_packet(None).unwrap();
        let frame = decoder.receive_frame().unwrap();
        assert_eq!(frame.pts, Some(0));
        assert_eq!(synthetic_frame_index(&frame.data), 0);
        assert_eq!(decoder.receive_frame().unwrap_err(), CodecError::Eof);

        decoder.flush();
        assert_eq!(decoder.receive_frame().unwrap_err(), CodecError::Again);
    }

    #[test]
    fn test_corrupt_packet_rejected() {
        let config = SyntheticVideoConfig {
            corrupt_frames: vec![0],
            ..Default::default()
        };
        let source = SyntheticVideoSource::new(config);
        let mut demuxer = source.open_demuxer().unwrap();
        let mut decoder = source.open_video_decoder(false).unwrap();
        let packet = demuxer.read_packet().unwrap();
        assert!(matches!(decoder.send_packet(Some(&packet)), Err(CodecError::InvalidData(_))));
    }

    #[test]
    fn test_frame_index_stamp() {
        let source = SyntheticVideoSource::new(SyntheticVideoConfig::default());
        let decoder = SyntheticVideoDecoder {
            config: source.config().clone(),
            queue: VecDeque::new(),
            input_eof: false,
        };
        let frame = decoder.render(70_000);
        assert_eq!(synthetic_frame_index(&frame.data[..3]), 70_000);
    }

    #[test]
    fn test_audio_packets_cover_stream() {
        let config = SyntheticAudioConfig {
            duration_ms: 50,
            ..Default::default()
        };
        let source = SyntheticAudioSource::new(config);
        let mut demuxer = source.open_demuxer().unwrap();
        let mut total = 0;
        while let Ok(packet) = demuxer.read_packet() {
            assert_eq!(packet.pts, Some(total));
            total += packet.duration;
        }
        assert_eq!(total, 2400);
    }

    #[test]
    fn test_audio_decoder_renders_samples() {
        let source = SyntheticAudioSource::new(SyntheticAudioConfig::default());
        let mut demuxer = source.open_demuxer().unwrap();
        let mut decoder = source.open_audio_decoder().unwrap();
        demuxer.seek(0, 2048).unwrap();
        let packet = demuxer.read_packet().unwrap();
        decoder.send_packet(Some(&packet)).unwrap();
        let frame = decoder.receive_frame().unwrap();
        assert_eq!(frame.pts, Some(2048));
        assert_eq!(frame.nb_samples, 1024);
        let right = SampleFormat::F32.read_f32(&frame.data[4..8]);
        assert_eq!(right, synthetic_sample(2048, 1));
    }
}
