//! FFmpeg media source (feature "ffmpeg")
//!
//! FFmpeg contexts are not `Send`, so every demuxer and decoder lives on a
//! private thread and is driven through a call channel. The seek table is
//! built once at open time by scanning the video stream's key packets.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded, unbounded};
use ffmpeg_next as ffmpeg;
use ffmpeg::media::Type;

use rf_core::{AudioFormat, Rational, RfError, RfResult, SampleFormat, rescale};

use crate::codec::{
    AudioDecoder, AudioStreamInfo, CodecError, DecodedAudioFrame, DecodedVideoFrame, Decoder,
    Demuxer, MediaInfo, MediaSource, Packet, PixelFormat, VideoDecoder, VideoStreamInfo,
};
use crate::seek_points::SeekPointTable;

fn ff_err(e: ffmpeg::Error) -> RfError {
    RfError::Codec(e.to_string())
}

fn codec_err(e: ffmpeg::Error) -> CodecError {
    match e {
        ffmpeg::Error::Eof => CodecError::Eof,
        ffmpeg::Error::Other { errno } if errno == ffmpeg::util::error::EAGAIN => CodecError::Again,
        ffmpeg::Error::InvalidData => CodecError::InvalidData(e.to_string()),
        other => CodecError::Other(other.to_string()),
    }
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator() as i64, r.denominator() as i64)
}

// ============ Call Thread ============

type Call<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Owns a non-`Send` value on its own thread
struct Worker<T> {
    calls: Option<Sender<Call<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: 'static> Worker<T> {
    fn spawn<F>(name: &str, init: F) -> RfResult<Self>
    where
        F: FnOnce() -> RfResult<T> + Send + 'static,
    {
        let (calls, inbox) = unbounded::<Call<T>>();
        let (ready_tx, ready_rx) = bounded::<RfResult<()>>(1);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut value = match init() {
                    Ok(v) => {
                        let _ = ready_tx.send(Ok(()));
                        v
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for call in inbox {
                    call(&mut value);
                }
            })
            .map_err(|e| RfError::Thread(e.to_string()))?;

        let worker = Self {
            calls: Some(calls),
            handle: Some(handle),
        };
        ready_rx
            .recv()
            .map_err(|_| RfError::Thread(format!("{} exited during setup", name)))??;
        Ok(worker)
    }

    fn call<R, F>(&self, f: F) -> Result<R, CodecError>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let calls = self
            .calls
            .as_ref()
            .ok_or_else(|| CodecError::Other("ffmpeg worker closed".into()))?;
        calls
            .send(Box::new(move |value: &mut T| {
                let _ = tx.send(f(value));
            }))
            .map_err(|_| CodecError::Other("ffmpeg worker gone".into()))?;
        rx.recv().map_err(|_| CodecError::Other("ffmpeg worker gone".into()))
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.calls = None;
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("ffmpeg worker panicked");
        }
    }
}

// ============ Source ============

pub struct FfmpegSource {
    path: PathBuf,
    info: MediaInfo,
    seek_points: SeekPointTable,
}

impl FfmpegSource {
    pub fn open(path: impl AsRef<Path>) -> RfResult<Self> {
        ffmpeg::init().map_err(ff_err)?;
        let path = path.as_ref().to_path_buf();
        let mut input = ffmpeg::format::input(&path).map_err(ff_err)?;

        let duration_ms = rescale(input.duration(), Rational::MICROS, Rational::MILLIS).max(0);

        let video = match input.streams().best(Type::Video) {
            Some(stream) => {
                let decoder = ffmpeg::codec::Context::from_parameters(stream.parameters())
                    .and_then(|c| c.decoder().video())
                    .map_err(ff_err)?;
                Some(VideoStreamInfo {
                    index: stream.index(),
                    time_base: rational(stream.time_base()),
                    start_pts: start_time(stream.start_time()),
                    width: decoder.width(),
                    height: decoder.height(),
                    frame_rate: rational(stream.avg_frame_rate()),
                })
            }
            None => None,
        };

        let audio = match input.streams().best(Type::Audio) {
            Some(stream) => {
                let decoder = ffmpeg::codec::Context::from_parameters(stream.parameters())
                    .and_then(|c| c.decoder().audio())
                    .map_err(ff_err)?;
                Some(AudioStreamInfo {
                    index: stream.index(),
                    time_base: rational(stream.time_base()),
                    start_pts: start_time(stream.start_time()),
                    format: AudioFormat::new(
                        decoder.ch_layout().channels().max(1) as u16,
                        decoder.rate(),
                        SampleFormat::F32,
                    ),
                })
            }
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(RfError::InvalidArgument(format!(
                "{} has no audio or video stream",
                path.display()
            )));
        }

        let mut points = Vec::new();
        if let Some(v) = &video {
            for (stream, packet) in input.packets() {
                if stream.index() == v.index
                    && packet.is_key()
                    && let Some(ts) = packet.pts().or(packet.dts())
                {
                    points.push(ts);
                }
            }
            if points.is_empty() {
                log::warn!("{}: no key packets found, seeking from stream start", path.display());
                points.push(v.start_pts);
            }
        }
        log::info!(
            "ffmpeg source {}: {} ms, {} seek points",
            path.display(),
            duration_ms,
            points.len()
        );

        Ok(Self {
            info: MediaInfo {
                url: path.display().to_string(),
                duration_ms,
                is_image: false,
                video,
                audio,
            },
            path,
            seek_points: SeekPointTable::new(points),
        })
    }
}

fn start_time(ts: i64) -> i64 {
    if ts == ffmpeg::ffi::AV_NOPTS_VALUE { 0 } else { ts }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn seek_points(&self) -> SeekPointTable {
        self.seek_points.clone()
    }

    fn open_demuxer(&self) -> RfResult<Box<dyn Demuxer>> {
        let path = self.path.clone();
        let time_bases: Vec<(usize, Rational)> = self
            .info
            .video
            .iter()
            .map(|v| (v.index, v.time_base))
            .chain(self.info.audio.iter().map(|a| (a.index, a.time_base)))
            .collect();
        let worker = Worker::spawn("rf-ffmpeg-demux", move || {
            ffmpeg::format::input(&path).map_err(ff_err)
        })?;
        Ok(Box::new(FfmpegDemuxer { worker, time_bases }))
    }

    fn open_video_decoder(&self, prefer_hardware: bool) -> RfResult<VideoDecoder> {
        let index = self
            .info
            .video
            .as_ref()
            .map(|v| v.index)
            .ok_or_else(|| RfError::InvalidArgument("no video stream".into()))?;
        if prefer_hardware {
            log::info!("hardware decoding unavailable, using software decoder");
        }
        let path = self.path.clone();
        let worker = Worker::spawn("rf-ffmpeg-vdec", move || {
            let input = ffmpeg::format::input(&path).map_err(ff_err)?;
            let stream = input
                .stream(index)
                .ok_or_else(|| RfError::InvalidArgument(format!("stream {} missing", index)))?;
            ffmpeg::codec::Context::from_parameters(stream.parameters())
                .and_then(|c| c.decoder().video())
                .map_err(ff_err)
        })?;
        Ok(Box::new(FfmpegVideoDecoder { worker }))
    }

    fn open_audio_decoder(&self) -> RfResult<AudioDecoder> {
        let index = self
            .info
            .audio
            .as_ref()
            .map(|a| a.index)
            .ok_or_else(|| RfError::InvalidArgument("no audio stream".into()))?;
        let path = self.path.clone();
        let worker = Worker::spawn("rf-ffmpeg-adec", move || {
            let input = ffmpeg::format::input(&path).map_err(ff_err)?;
            let stream = input
                .stream(index)
                .ok_or_else(|| RfError::InvalidArgument(format!("stream {} missing", index)))?;
            ffmpeg::codec::Context::from_parameters(stream.parameters())
                .and_then(|c| c.decoder().audio())
                .map_err(ff_err)
        })?;
        Ok(Box::new(FfmpegAudioDecoder { worker }))
    }
}

// ============ Demuxer ============

struct FfmpegDemuxer {
    worker: Worker<ffmpeg::format::context::Input>,
    time_bases: Vec<(usize, Rational)>,
}

impl Demuxer for FfmpegDemuxer {
    fn seek(&mut self, stream_index: usize, pts: i64) -> Result<(), CodecError> {
        let tb = self
            .time_bases
            .iter()
            .find(|(i, _)| *i == stream_index)
            .map(|(_, tb)| *tb)
            .ok_or_else(|| CodecError::Other(format!("unknown stream {}", stream_index)))?;
        let ts = rescale(pts, tb, Rational::MICROS);
        self.worker
            .call(move |input| input.seek(ts, ..ts).map_err(codec_err))?
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        self.worker.call(|input| {
            let mut packet = ffmpeg::Packet::empty();
            packet.read(input).map_err(codec_err)?;
            Ok(Packet {
                stream_index: packet.stream(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                is_key: packet.is_key(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            })
        })?
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.is_key {
        out.set_flags(ffmpeg::packet::Flags::KEY);
    }
    out
}

fn send(decoder: &mut ffmpeg::decoder::Opened, packet: Option<ffmpeg::Packet>) -> Result<(), CodecError> {
    match packet {
        Some(p) => decoder.send_packet(&p).map_err(codec_err),
        None => decoder.send_eof().map_err(codec_err),
    }
}

// ============ Video Decoder ============

struct FfmpegVideoDecoder {
    worker: Worker<ffmpeg::decoder::Video>,
}

impl Decoder<DecodedVideoFrame> for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        let packet = packet.map(to_ffmpeg_packet);
        self.worker.call(move |decoder| send(decoder, packet))?
    }

    fn receive_frame(&mut self) -> Result<DecodedVideoFrame, CodecError> {
        self.worker.call(|decoder| {
            let mut decoded = ffmpeg::frame::Video::empty();
            decoder.receive_frame(&mut decoded).map_err(codec_err)?;
            let (w, h) = (decoded.width(), decoded.height());
            let mut scaler = ffmpeg::software::scaling::Context::get(
                decoded.format(),
                w,
                h,
                ffmpeg::format::Pixel::RGB24,
                w,
                h,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| CodecError::Other(e.to_string()))?;
            let mut rgb = ffmpeg::frame::Video::empty();
            scaler
                .run(&decoded, &mut rgb)
                .map_err(|e| CodecError::InvalidData(e.to_string()))?;

            // copy row by row, the source stride may carry padding
            let row = w as usize * 3;
            let stride = rgb.stride(0);
            let mut data = Vec::with_capacity(row * h as usize);
            for line in rgb.data(0).chunks(stride).take(h as usize) {
                data.extend_from_slice(&line[..row.min(line.len())]);
            }
            Ok(DecodedVideoFrame {
                pts: decoded.timestamp().or(decoded.pts()),
                width: w,
                height: h,
                format: PixelFormat::Rgb24,
                data,
                stride: row,
            })
        })?
    }

    fn flush(&mut self) {
        if self.worker.call(|decoder| decoder.flush()).is_err() {
            log::warn!("video decoder flush failed");
        }
    }
}

// ============ Audio Decoder ============

struct FfmpegAudioDecoder {
    worker: Worker<ffmpeg::decoder::Audio>,
}

impl Decoder<DecodedAudioFrame> for FfmpegAudioDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        let packet = packet.map(to_ffmpeg_packet);
        self.worker.call(move |decoder| send(decoder, packet))?
    }

    fn receive_frame(&mut self) -> Result<DecodedAudioFrame, CodecError> {
        self.worker.call(|decoder| {
            let mut decoded = ffmpeg::frame::Audio::empty();
            decoder.receive_frame(&mut decoded).map_err(codec_err)?;

            let packed = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed);
            let mut resampler = ffmpeg::software::resampling::Context::get2(
                decoded.format(),
                decoded.ch_layout(),
                decoded.rate(),
                packed,
                decoded.ch_layout(),
                decoded.rate(),
            )
            .map_err(|e| CodecError::Other(e.to_string()))?;
            let mut out = ffmpeg::frame::Audio::empty();
            resampler
                .run(&decoded, &mut out)
                .map_err(|e| CodecError::InvalidData(e.to_string()))?;

            let format = AudioFormat::new(
                decoded.ch_layout().channels().max(1) as u16,
                decoded.rate(),
                SampleFormat::F32,
            );
            let len = out.samples() * format.frame_size();
            let data = out.data(0).get(..len).map(<[u8]>::to_vec).unwrap_or_default();
            Ok(DecodedAudioFrame {
                pts: decoded.timestamp().or(decoded.pts()),
                nb_samples: data.len() / format.frame_size(),
                format,
                data,
            })
        })?
    }

    fn flush(&mut self) {
        if self.worker.call(|decoder| decoder.flush()).is_err() {
            log::warn!("audio decoder flush failed");
        }
    }
}
