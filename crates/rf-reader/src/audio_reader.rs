//! Audio reader
//!
//! Same pipeline as video, over fixed-length audio tasks. Reads are
//! cursor-based: each `read_audio_samples` call continues where the last one
//! stopped, forward or backward. Backward reads return the samples before
//! the cursor in reverse order, taken from each frame's pre-reversed buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use rf_core::{
    AudioFormat, Direction, RfError, RfResult, SampleFormat, ms_to_pts, ms_to_samples,
    pts_to_samples, samples_to_ms, samples_to_pts,
};

use crate::cache_window::CacheWindow;
use crate::codec::{AudioDecoder, DecodedAudioFrame, Demuxer, MediaInfo, MediaSource};
use crate::config::{ReaderConfig, secs_to_ms};
use crate::convert::{LinearResampler, ResamplerFactory};
use crate::frame::AudioPcm;
use crate::lifecycle::{Interrupt, InterruptReason, ReaderStats};
use crate::pipeline::{
    DecodeOptions, ErrorSlot, Pipeline, PipelineShared, join_workers, run_audio_convert,
    run_decode, run_demux, spawn_worker,
};
use crate::scheduler::{
    PendingSeek, SchedulerParams, SeekRequest, StreamTiming, TaskScheduler,
};
use crate::seek_points::SeekPointTable;

type AudioPipeline = Pipeline<DecodedAudioFrame, Arc<AudioPcm>>;
type AudioShared = PipelineShared<DecodedAudioFrame, Arc<AudioPcm>>;
type AudioScheduler = TaskScheduler<DecodedAudioFrame, Arc<AudioPcm>>;

/// Result of one `read_audio_samples` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioReadOutcome {
    /// Bytes written to the front of the buffer
    pub bytes: usize,
    /// Sample frames written
    pub frames: usize,
    /// Media time of the cursor before the read
    pub pos_ms: i64,
    /// The cursor reached the end (or the start, reading backward)
    pub eof: bool,
}

struct AudioState {
    source: Option<Arc<dyn MediaSource>>,
    closed: bool,
    config: ReaderConfig,
    output: Option<AudioFormat>,
    resampler_factory: ResamplerFactory,
    direction: Direction,
    forward_ms: i64,
    backward_ms: i64,
    seeking_mode: bool,
    /// Next sample to read, at the output rate
    cursor: i64,
    started: bool,
    pipeline: Option<AudioPipeline>,
}

pub struct AudioReader {
    state: Mutex<AudioState>,
    pending_seek: PendingSeek,
    pending_cursor: Mutex<Option<i64>>,
    /// Output sample rate, readable while a read holds the state lock
    rate: AtomicU32,
    errors: Arc<ErrorSlot>,
    interrupt: Interrupt,
}

impl AudioReader {
    pub fn new(config: ReaderConfig) -> RfResult<Self> {
        config.validate()?;
        let forward_ms = config.forward_cache_ms();
        let backward_ms = config.backward_cache_ms();
        let default_factory: ResamplerFactory = Arc::new(|| Box::new(LinearResampler::new()));
        Ok(Self {
            state: Mutex::new(AudioState {
                source: None,
                closed: false,
                config,
                output: None,
                resampler_factory: default_factory,
                direction: Direction::Forward,
                forward_ms,
                backward_ms,
                seeking_mode: false,
                cursor: 0,
                started: false,
                pipeline: None,
            }),
            pending_seek: Arc::new(Mutex::new(None)),
            pending_cursor: Mutex::new(None),
            rate: AtomicU32::new(AudioFormat::default().sample_rate),
            errors: Arc::new(ErrorSlot::default()),
            interrupt: Interrupt::default(),
        })
    }

    // ============ Lifecycle ============

    pub fn open(&self, source: Arc<dyn MediaSource>) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.source.is_some() {
            return Err(RfError::Config("audio reader already open".into()));
        }
        let info = source.info();
        if info.audio.is_none() {
            return Err(RfError::InvalidArgument(format!("{} has no audio stream", info.url)));
        }
        log::info!("audio reader open: {} ({} ms)", info.url, info.duration_ms);
        st.source = Some(source);
        st.closed = false;
        st.cursor = 0;
        self.errors.clear();
        self.interrupt.clear();
        Ok(())
    }

    /// Set the output PCM layout; only before `start`
    pub fn configure(&self, output: AudioFormat) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.source.is_none() {
            return Err(RfError::Config("configure called before open".into()));
        }
        if st.started {
            return Err(RfError::Config("audio output cannot change while started".into()));
        }
        output.validate()?;
        st.output = Some(output);
        self.rate.store(output.sample_rate, Ordering::Release);
        Ok(())
    }

    pub fn set_resampler(&self, factory: ResamplerFactory) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.started {
            return Err(RfError::Config("resampler must be set before start".into()));
        }
        st.resampler_factory = factory;
        Ok(())
    }

    pub fn start(&self) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.source.is_none() {
            return Err(RfError::Config("start called before open".into()));
        }
        if st.output.is_none() {
            return Err(RfError::Config("start called before configure".into()));
        }
        if st.started {
            return Ok(());
        }
        self.interrupt.clear();
        self.sync_cursor(&mut st);
        let pipeline = self.build_pipeline(&st)?;
        st.pipeline = Some(pipeline);
        st.started = true;
        Ok(())
    }

    pub fn stop(&self) {
        self.interrupt.raise(InterruptReason::Stop);
        let mut st = self.state.lock();
        if let Some(mut pipeline) = st.pipeline.take() {
            pipeline.stop();
        }
        st.started = false;
    }

    pub fn close(&self) {
        self.interrupt.raise(InterruptReason::Close);
        let mut st = self.state.lock();
        if let Some(mut pipeline) = st.pipeline.take() {
            pipeline.stop();
        }
        st.started = false;
        st.source = None;
        st.output = None;
        st.closed = true;
        log::debug!("audio reader closed");
    }

    fn build_pipeline(&self, st: &AudioState) -> RfResult<AudioPipeline> {
        let source = st
            .source
            .clone()
            .ok_or_else(|| RfError::Config("no source".into()))?;
        let output = st
            .output
            .ok_or_else(|| RfError::Config("no output format".into()))?;
        let info = source.info().clone();
        let audio = info
            .audio
            .clone()
            .ok_or_else(|| RfError::InvalidArgument("no audio stream".into()))?;

        let tb = audio.time_base;
        let step = ms_to_pts(secs_to_ms(st.config.audio_task_secs), tb).max(1);
        let end = audio.start_pts + ms_to_pts(info.duration_ms, tb);
        let table = SeekPointTable::uniform(audio.start_pts, step, end);

        let timing = StreamTiming {
            time_base: tb,
            start_pts: audio.start_pts,
            duration_ms: info.duration_ms,
        };
        let params = SchedulerParams {
            direction: st.direction,
            forward_ms: st.forward_ms,
            backward_ms: st.backward_ms,
            seeking_mode: st.seeking_mode,
        };
        let scheduler: AudioScheduler =
            TaskScheduler::new("audio", table, timing, params, self.pending_seek.clone());
        scheduler.set_read_pos(samples_to_ms(st.cursor, output.sample_rate));
        scheduler.reset_build_task();

        let demuxer = source.open_demuxer()?;
        let decoder = source.open_audio_decoder()?;

        let shared = Arc::new(PipelineShared::new(
            scheduler,
            audio.index,
            st.config.idle_wait(),
            self.errors.clone(),
        ));
        let start_pts = audio.start_pts;
        let rate = output.sample_rate;
        let position = move |pts: i64| pts_to_samples(pts - start_pts, tb, rate);

        let mut workers = Vec::with_capacity(3);
        let convert = (
            output,
            (st.resampler_factory)(),
            st.config.pcm_dump_path.clone(),
        );
        if let Err(e) = spawn_audio_workers(&mut workers, &shared, (demuxer, decoder), position, convert) {
            shared.request_quit();
            join_workers(workers);
            return Err(e);
        }
        Ok(Pipeline::new(shared, workers))
    }

    // ============ Parameters ============

    pub fn set_direction(&self, forward: bool) {
        let mut st = self.state.lock();
        let direction = Direction::from_forward(forward);
        st.direction = direction;
        if let Some(pipeline) = &st.pipeline {
            pipeline.shared.scheduler.set_direction(direction);
            pipeline.shared.demux_kick.kick();
        }
    }

    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    pub fn is_direction_forward(&self) -> bool {
        self.direction().is_forward()
    }

    pub fn set_cache_duration(&self, forward_secs: f64, backward_secs: f64) -> RfResult<()> {
        if !(forward_secs >= 0.0 && backward_secs >= 0.0) {
            return Err(RfError::InvalidArgument(format!(
                "cache durations must be non-negative ({}, {})",
                forward_secs, backward_secs
            )));
        }
        let mut st = self.state.lock();
        st.forward_ms = secs_to_ms(forward_secs);
        st.backward_ms = secs_to_ms(backward_secs);
        if let Some(pipeline) = &st.pipeline {
            pipeline.shared.scheduler.set_cache_duration(st.forward_ms, st.backward_ms);
            pipeline.shared.demux_kick.kick();
        }
        Ok(())
    }

    pub fn seek_to(&self, pos_ms: i64, seeking_mode: bool) -> RfResult<()> {
        if pos_ms < 0 {
            return Err(RfError::InvalidArgument(format!("negative seek position {}", pos_ms)));
        }
        let rate = self.rate.load(Ordering::Acquire);
        self.seek_internal(ms_to_samples(pos_ms, rate), pos_ms, seeking_mode);
        Ok(())
    }

    /// Seek to an exact sample index at the output rate
    pub fn seek_to_sample(&self, sample: i64) -> RfResult<()> {
        if sample < 0 {
            return Err(RfError::InvalidArgument(format!("negative sample index {}", sample)));
        }
        let rate = self.rate.load(Ordering::Acquire);
        self.seek_internal(sample, samples_to_ms(sample, rate), false);
        Ok(())
    }

    fn seek_internal(&self, sample: i64, pos_ms: i64, seeking_mode: bool) {
        let req = SeekRequest {
            pos_ms,
            seeking_mode,
        };
        match self.state.try_lock() {
            Some(mut st) => {
                *self.pending_cursor.lock() = None;
                st.cursor = sample;
                st.seeking_mode = seeking_mode;
                if let Some(pipeline) = &st.pipeline {
                    pipeline.shared.scheduler.apply_seek(req);
                    pipeline.shared.demux_kick.kick();
                }
            }
            None => {
                log::trace!("audio seek to sample {} deferred", sample);
                *self.pending_cursor.lock() = Some(sample);
                *self.pending_seek.lock() = Some(req);
            }
        }
    }

    fn sync_cursor(&self, st: &mut AudioState) {
        if let Some(cursor) = self.pending_cursor.lock().take() {
            st.cursor = cursor;
        }
    }

    // ============ Reading ============

    /// Fill `buf` with interleaved samples from the cursor on, in the
    /// current direction, and advance the cursor by what was written.
    ///
    /// With `wait` the call blocks until the whole request (or everything
    /// up to the end of the stream) is available. Without it, only samples
    /// from fully converted tasks are returned, possibly none.
    pub fn read_audio_samples(&self, buf: &mut [u8], wait: bool) -> RfResult<AudioReadOutcome> {
        let mut st = self.state.lock();
        self.sync_cursor(&mut st);
        let (info, format) = self.check_readable(&st)?;
        let shared = match &st.pipeline {
            Some(pipeline) => pipeline.shared.clone(),
            None => return Err(RfError::NotReady("audio pipeline not running".into())),
        };

        let fs = format.frame_size();
        let want = buf.len() / fs;
        let rate = format.sample_rate;
        let forward = st.direction.is_forward();
        let start = st.cursor;
        let pos_ms = samples_to_ms(start, rate);

        if shared.scheduler.read_pos() != pos_ms && self.pending_cursor.lock().is_none() {
            shared.scheduler.set_read_pos(pos_ms);
            shared.demux_kick.kick();
        }

        let mut origin = start;
        let mut done = 0usize;
        loop {
            self.interrupt.check()?;
            let seen = shared.progress.generation();

            let total = total_samples(&shared.scheduler, &info, rate);
            if !forward && done == 0 {
                origin = start.min(total);
            }
            let available = if forward {
                (total - origin).max(0)
            } else {
                origin.max(0)
            };
            let n = want.min(available as usize);
            let cursor = if forward {
                origin + done as i64
            } else {
                origin - done as i64
            };
            if done < n {
                let out = &mut buf[done * fs..n * fs];
                done += if forward {
                    fill_forward(&shared.scheduler, format, cursor, n - done, out)
                } else {
                    fill_backward(&shared.scheduler, format, cursor, n - done, out)
                };
            }

            if done >= n || !wait || shared.is_fatal() {
                let filled = done.min(n);
                st.cursor = if forward {
                    origin + filled as i64
                } else {
                    origin - filled as i64
                };
                let eof = if forward { st.cursor >= total } else { st.cursor <= 0 };
                if self.pending_cursor.lock().is_none() {
                    shared.scheduler.set_read_pos(samples_to_ms(st.cursor, rate));
                    shared.demux_kick.kick();
                }
                return Ok(AudioReadOutcome {
                    bytes: filled * fs,
                    frames: filled,
                    pos_ms,
                    eof,
                });
            }

            // pull the window along to the first missing sample
            let missing = if forward {
                origin + done as i64
            } else {
                origin - done as i64
            };
            let missing_ms = samples_to_ms(missing, rate);
            if shared.scheduler.read_pos() != missing_ms {
                shared.scheduler.set_read_pos(missing_ms);
                shared.demux_kick.kick();
            }
            shared.progress.wait_since(seen, shared.idle);
        }
    }

    fn check_readable(&self, st: &AudioState) -> RfResult<(MediaInfo, AudioFormat)> {
        if st.closed {
            return Err(RfError::Closed);
        }
        let source = st
            .source
            .as_ref()
            .ok_or_else(|| RfError::NotReady("audio reader not open".into()))?;
        if !st.started {
            return Err(RfError::NotReady("audio reader not started".into()));
        }
        let format = st
            .output
            .ok_or_else(|| RfError::Config("audio output not configured".into()))?;
        Ok((source.info().clone(), format))
    }

    // ============ Introspection ============

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.state.lock().source.as_ref().map(|s| s.info().clone())
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.state.lock().output
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Cursor position (sample index at the output rate)
    pub fn cursor(&self) -> i64 {
        if let Some(cursor) = *self.pending_cursor.lock() {
            return cursor;
        }
        self.state.lock().cursor
    }

    pub fn read_pos(&self) -> i64 {
        samples_to_ms(self.cursor(), self.rate.load(Ordering::Acquire))
    }

    /// Total samples at the output rate, shortened once the end of the
    /// stream has actually been seen
    pub fn total_samples(&self) -> Option<i64> {
        let st = self.state.lock();
        let info = st.source.as_ref()?.info().clone();
        let rate = st.output?.sample_rate;
        Some(match &st.pipeline {
            Some(pipeline) => total_samples(&pipeline.shared.scheduler, &info, rate),
            None => ms_to_samples(info.duration_ms, rate),
        })
    }

    pub fn cache_window(&self) -> Option<CacheWindow> {
        let st = self.state.lock();
        st.pipeline.as_ref().map(|p| p.shared.scheduler.window())
    }

    pub fn stats(&self) -> ReaderStats {
        let st = self.state.lock();
        st.pipeline
            .as_ref()
            .map(|p| ReaderStats::collect(&p.shared.scheduler))
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<RfError> {
        self.errors.get().map(RfError::Fatal)
    }
}

fn spawn_audio_workers<P>(
    workers: &mut Vec<JoinHandle<()>>,
    shared: &Arc<AudioShared>,
    (demuxer, decoder): (Box<dyn Demuxer>, AudioDecoder),
    position: P,
    (output, resampler, dump): (AudioFormat, Box<dyn crate::convert::Resampler>, Option<std::path::PathBuf>),
) -> RfResult<()>
where
    P: Fn(i64) -> i64 + Send + 'static,
{
    let options = DecodeOptions {
        max_pending: None,
        clip_to_task: false,
    };
    let s = shared.clone();
    workers.push(spawn_worker("rf-audio-demux".into(), move || run_demux(s, demuxer))?);
    let s = shared.clone();
    workers.push(spawn_worker("rf-audio-decode".into(), move || {
        run_decode(s, decoder, options, position)
    })?);
    let s = shared.clone();
    workers.push(spawn_worker("rf-audio-convert".into(), move || {
        run_audio_convert(s, output, resampler, dump)
    })?);
    Ok(())
}

// ============ Sample Assembly ============

fn total_samples(scheduler: &AudioScheduler, info: &MediaInfo, rate: u32) -> i64 {
    let nominal = ms_to_samples(info.duration_ms, rate);
    match scheduler.eof_data_end() {
        Some(end) => {
            let timing = scheduler.timing();
            nominal.min(pts_to_samples(end - timing.start_pts, timing.time_base, rate).max(0))
        }
        None => nominal,
    }
}

fn fill_silence(buf: &mut [u8], format: AudioFormat) {
    let value = if format.sample_format == SampleFormat::U8 { 0x80 } else { 0 };
    buf.fill(value);
}

/// Sample range `[begin, end)` of a task at the output rate
fn task_sample_range(scheduler: &AudioScheduler, start_pts: i64, end_pts: i64, rate: u32) -> (i64, i64) {
    let timing = scheduler.timing();
    let begin = pts_to_samples(start_pts - timing.start_pts, timing.time_base, rate);
    let end = if end_pts == i64::MAX {
        i64::MAX
    } else {
        pts_to_samples(end_pts - timing.start_pts, timing.time_base, rate)
    };
    (begin, end)
}

fn sample_pts(scheduler: &AudioScheduler, sample: i64, rate: u32) -> i64 {
    let timing = scheduler.timing();
    timing.start_pts + samples_to_pts(sample, timing.time_base, rate)
}

/// Copy samples `[start, start + n)` in media order; stops at the first
/// task that is not fully converted. Returns frames written.
fn fill_forward(scheduler: &AudioScheduler, format: AudioFormat, start: i64, n: usize, buf: &mut [u8]) -> usize {
    let fs = format.frame_size();
    let rate = format.sample_rate;
    let mut done = 0usize;

    while done < n {
        let pos = start + done as i64;
        let Some(task) = scheduler.task_at(sample_pts(scheduler, pos, rate)) else {
            break;
        };
        if !task.is_ready() {
            break;
        }

        let (_, task_end) = task_sample_range(scheduler, task.start_pts, task.end_pts, rate);
        let span = (task_end.max(pos + 1) - pos).min((n - done) as i64) as usize;
        let out = &mut buf[done * fs..(done + span) * fs];
        fill_silence(out, format);

        let (lo, hi) = (pos, pos + span as i64);
        for (slot_pos, pcm) in task.converted_frames() {
            let frames = pcm.frames() as i64;
            let a = slot_pos.max(lo);
            let b = (slot_pos + frames).min(hi);
            if a >= b {
                continue;
            }
            let src = (a - slot_pos) as usize * fs..(b - slot_pos) as usize * fs;
            let dst = (a - lo) as usize * fs..(b - lo) as usize * fs;
            out[dst].copy_from_slice(&pcm.forward[src]);
        }
        done += span;
    }
    done
}

/// Copy samples `[end - n, end)` in reverse media order. Returns frames written.
fn fill_backward(scheduler: &AudioScheduler, format: AudioFormat, end: i64, n: usize, buf: &mut [u8]) -> usize {
    let fs = format.frame_size();
    let rate = format.sample_rate;
    let mut done = 0usize;

    while done < n {
        let hi = end - done as i64;
        let Some(task) = scheduler.task_at(sample_pts(scheduler, hi - 1, rate)) else {
            break;
        };
        if !task.is_ready() {
            break;
        }

        let (task_begin, _) = task_sample_range(scheduler, task.start_pts, task.end_pts, rate);
        let lo = task_begin.min(hi - 1).max(hi - (n - done) as i64);
        let span = (hi - lo) as usize;
        let out = &mut buf[done * fs..(done + span) * fs];
        fill_silence(out, format);

        for (slot_pos, pcm) in task.converted_frames() {
            let frames = pcm.frames() as i64;
            let a = slot_pos.max(lo);
            let b = (slot_pos + frames).min(hi);
            if a >= b {
                continue;
            }
            // backward[j] holds sample slot_pos + frames - 1 - j
            let slot_end = slot_pos + frames;
            let src = (slot_end - b) as usize * fs..(slot_end - a) as usize * fs;
            let dst = (hi - b) as usize * fs..(hi - a) as usize * fs;
            out[dst].copy_from_slice(&pcm.backward[src]);
        }
        done += span;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticAudioConfig, SyntheticAudioSource};

    #[test]
    fn test_configure_rejected_while_started() {
        let reader = AudioReader::new(ReaderConfig::default()).unwrap();
        reader
            .open(Arc::new(SyntheticAudioSource::new(SyntheticAudioConfig::default())))
            .unwrap();
        reader.configure(AudioFormat::default()).unwrap();
        reader.start().unwrap();
        assert!(matches!(reader.configure(AudioFormat::default()), Err(RfError::Config(_))));
        reader.stop();
        assert!(!reader.is_started());
    }

    #[test]
    fn test_invalid_format_rejected() {
        let reader = AudioReader::new(ReaderConfig::default()).unwrap();
        reader
            .open(Arc::new(SyntheticAudioSource::new(SyntheticAudioConfig::default())))
            .unwrap();
        let bad = AudioFormat::new(2, 0, SampleFormat::F32);
        assert!(matches!(reader.configure(bad), Err(RfError::InvalidSampleRate(0))));
    }

    #[test]
    fn test_seek_to_sample_moves_cursor() {
        let reader = AudioReader::new(ReaderConfig::default()).unwrap();
        reader
            .open(Arc::new(SyntheticAudioSource::new(SyntheticAudioConfig::default())))
            .unwrap();
        reader.configure(AudioFormat::default()).unwrap();
        reader.seek_to_sample(48_000).unwrap();
        assert_eq!(reader.cursor(), 48_000);
        assert_eq!(reader.read_pos(), 1000);
        reader.seek_to(250, false).unwrap();
        assert_eq!(reader.cursor(), 12_000);
    }
}
