//! Video reader
//!
//! Lifecycle: `open` a source, `configure` the output, `start` the pipeline.
//! `read_video_frame` then returns the converted frame shown at a media
//! position, blocking (if asked to) until the pipeline has produced it.
//!
//! All API calls serialize on one lock. `seek_to` alone never blocks on it:
//! when the lock is busy (typically a blocking read) the seek is parked in a
//! side slot and the demux thread applies it on its next tick.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use rf_core::{Direction, Rational, RfError, RfResult, pts_to_ms, rescale};

use crate::cache_window::CacheWindow;
use crate::codec::{DecodedVideoFrame, Demuxer, MediaInfo, MediaSource, VideoDecoder};
use crate::config::{ReaderConfig, VideoOutputConfig, secs_to_ms};
use crate::convert::{FrameConverterFactory, ImageFrameConverter};
use crate::frame::VideoFrame;
use crate::lifecycle::{Interrupt, InterruptReason, ReaderStats};
use crate::pipeline::{
    DecodeOptions, ErrorSlot, Pipeline, PipelineShared, VideoOutputSlot, join_workers,
    run_auto_release, run_decode, run_demux, run_video_convert, spawn_worker,
};
use crate::scheduler::{
    PendingSeek, SchedulerParams, SeekRequest, StreamTiming, TaskScheduler,
};

type VideoPipeline = Pipeline<DecodedVideoFrame, Arc<VideoFrame>>;
type VideoShared = PipelineShared<DecodedVideoFrame, Arc<VideoFrame>>;
type VideoScheduler = TaskScheduler<DecodedVideoFrame, Arc<VideoFrame>>;

enum Lookup {
    /// Definitive answer for the position
    Ready(Option<Arc<VideoFrame>>),
    /// Best frame so far; a better one may still be converted
    Pending(Option<Arc<VideoFrame>>),
}

struct VideoState {
    source: Option<Arc<dyn MediaSource>>,
    closed: bool,
    config: ReaderConfig,
    output: Option<VideoOutputConfig>,
    output_slot: Arc<VideoOutputSlot>,
    converter_factory: FrameConverterFactory,
    direction: Direction,
    forward_ms: i64,
    backward_ms: i64,
    read_pos: i64,
    seeking_mode: bool,
    started: bool,
    suspended: bool,
    pipeline: Option<VideoPipeline>,
    last_frame: Option<(i64, Arc<VideoFrame>)>,
}

pub struct VideoReader {
    state: Mutex<VideoState>,
    pending_seek: PendingSeek,
    errors: Arc<ErrorSlot>,
    interrupt: Interrupt,
}

impl VideoReader {
    pub fn new(config: ReaderConfig) -> RfResult<Self> {
        config.validate()?;
        let forward_ms = config.forward_cache_ms();
        let backward_ms = config.backward_cache_ms();
        let default_factory: FrameConverterFactory =
            Arc::new(|| Box::new(ImageFrameConverter::default()));
        Ok(Self {
            state: Mutex::new(VideoState {
                source: None,
                closed: false,
                config,
                output: None,
                output_slot: Arc::new(VideoOutputSlot::default()),
                converter_factory: default_factory,
                direction: Direction::Forward,
                forward_ms,
                backward_ms,
                read_pos: 0,
                seeking_mode: false,
                started: false,
                suspended: false,
                pipeline: None,
                last_frame: None,
            }),
            pending_seek: Arc::new(Mutex::new(None)),
            errors: Arc::new(ErrorSlot::default()),
            interrupt: Interrupt::default(),
        })
    }

    // ============ Lifecycle ============

    pub fn open(&self, source: Arc<dyn MediaSource>) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.source.is_some() {
            return Err(RfError::Config("video reader already open".into()));
        }
        let info = source.info();
        if info.video.is_none() {
            return Err(RfError::InvalidArgument(format!("{} has no video stream", info.url)));
        }
        log::info!(
            "video reader open: {} ({} ms{})",
            info.url,
            info.duration_ms,
            if info.is_image { ", image" } else { "" }
        );
        st.source = Some(source);
        st.closed = false;
        st.read_pos = 0;
        st.last_frame = None;
        self.errors.clear();
        self.interrupt.clear();
        Ok(())
    }

    /// Set (or change) the output size and pixel format.
    ///
    /// On a running reader this rebuilds every task so stale frames are
    /// never returned.
    pub fn configure(&self, output: VideoOutputConfig) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.source.is_none() {
            return Err(RfError::Config("configure called before open".into()));
        }
        if output.width > 16_384 || output.height > 16_384 {
            return Err(RfError::Config(format!(
                "output size {}x{} out of range",
                output.width, output.height
            )));
        }
        st.output = Some(output);
        st.output_slot.set(output);
        st.last_frame = None;
        if let Some(pipeline) = &st.pipeline {
            pipeline.shared.scheduler.reset_build_task();
            pipeline.shared.demux_kick.kick();
        }
        Ok(())
    }

    /// Replace the built-in converter; only before `start`
    pub fn set_frame_converter(&self, factory: FrameConverterFactory) -> RfResult<()> {
        let mut st = self.state.lock();
        if st.started {
            return Err(RfError::Config("frame converter must be set before start".into()));
        }
        st.converter_factory = factory;
        Ok(())
    }

    /// Start the pipeline; with `suspended` the reader starts parked and
    /// spawns its threads on `wakeup`.
    pub fn start(&self, suspended: bool) -> RfResult<()> {
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
        if !suspended {
            let pipeline = self.build_pipeline(&mut st)?;
            st.pipeline = Some(pipeline);
        }
        st.started = true;
        st.suspended = suspended;
        Ok(())
    }

    pub fn stop(&self) {
        self.interrupt.raise(InterruptReason::Stop);
        let mut st = self.state.lock();
        self.stop_locked(&mut st);
        st.started = false;
        st.suspended = false;
    }

    pub fn close(&self) {
        self.interrupt.raise(InterruptReason::Close);
        let mut st = self.state.lock();
        self.stop_locked(&mut st);
        st.started = false;
        st.suspended = false;
        st.source = None;
        st.output = None;
        st.closed = true;
        log::debug!("video reader closed");
    }

    fn stop_locked(&self, st: &mut VideoState) {
        if let Some(mut pipeline) = st.pipeline.take() {
            st.read_pos = pipeline.shared.scheduler.read_pos();
            pipeline.stop();
        }
        st.last_frame = None;
    }

    /// Stop the worker threads but remember where reading was
    pub fn suspend(&self) -> RfResult<()> {
        self.interrupt.raise(InterruptReason::Suspend);
        let mut st = self.state.lock();
        self.interrupt.clear();
        if !st.started || st.suspended {
            return Ok(());
        }
        if st.source.as_ref().is_some_and(|s| s.info().is_image) {
            return Ok(());
        }
        self.stop_locked(&mut st);
        st.suspended = true;
        log::debug!("video reader suspended at {} ms", st.read_pos);
        Ok(())
    }

    pub fn wakeup(&self) -> RfResult<()> {
        let mut st = self.state.lock();
        if !st.started || !st.suspended {
            return Ok(());
        }
        let pipeline = self.build_pipeline(&mut st)?;
        st.pipeline = Some(pipeline);
        st.suspended = false;
        log::debug!("video reader woke up at {} ms", st.read_pos);
        Ok(())
    }

    fn build_pipeline(&self, st: &mut VideoState) -> RfResult<VideoPipeline> {
        let source = st
            .source
            .clone()
            .ok_or_else(|| RfError::Config("no source".into()))?;
        let info = source.info().clone();
        let video = info
            .video
            .clone()
            .ok_or_else(|| RfError::InvalidArgument("no video stream".into()))?;

        let timing = StreamTiming {
            time_base: video.time_base,
            start_pts: video.start_pts,
            duration_ms: info.duration_ms,
        };
        let params = SchedulerParams {
            direction: st.direction,
            forward_ms: st.forward_ms,
            backward_ms: st.backward_ms,
            seeking_mode: st.seeking_mode,
        };
        let scheduler: VideoScheduler = TaskScheduler::new(
            "video",
            source.seek_points(),
            timing.clone(),
            params,
            self.pending_seek.clone(),
        );
        scheduler.set_read_pos(if info.is_image { 0 } else { st.read_pos });
        scheduler.reset_build_task();

        let demuxer = source.open_demuxer()?;
        let decoder = source.open_video_decoder(st.config.prefer_hardware)?;

        let shared = Arc::new(PipelineShared::new(
            scheduler,
            video.index,
            st.config.idle_wait(),
            self.errors.clone(),
        ));
        let options = DecodeOptions {
            max_pending: Some(st.config.max_pending_frames),
            clip_to_task: !info.is_image,
        };
        let position = move |pts: i64| pts_to_ms(pts - timing.start_pts, timing.time_base);

        let mut workers = Vec::with_capacity(3);
        if let Err(e) = spawn_video_workers(
            &mut workers,
            &shared,
            (demuxer, decoder),
            options,
            position,
            (st.output_slot.clone(), st.converter_factory.clone()),
        ) {
            shared.request_quit();
            join_workers(workers);
            return Err(e);
        }

        if info.is_image {
            let s = shared.clone();
            let handle = match spawn_worker("rf-video-release".into(), move || {
                run_auto_release(s, workers)
            }) {
                Ok(handle) => handle,
                Err(e) => {
                    // the closure owning the workers was dropped unrun
                    shared.request_quit();
                    return Err(e);
                }
            };
            return Ok(Pipeline::new(shared, vec![handle]));
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

    /// Move the read head. `seeking_mode` (scrubbing) shrinks the cache to
    /// the GOP under the read head until the next non-scrubbing seek.
    pub fn seek_to(&self, pos_ms: i64, seeking_mode: bool) -> RfResult<()> {
        if pos_ms < 0 {
            return Err(RfError::InvalidArgument(format!("negative seek position {}", pos_ms)));
        }
        let req = SeekRequest {
            pos_ms,
            seeking_mode,
        };
        match self.state.try_lock() {
            Some(mut st) => {
                st.read_pos = pos_ms;
                st.seeking_mode = seeking_mode;
                st.last_frame = None;
                if let Some(pipeline) = &st.pipeline {
                    pipeline.shared.scheduler.apply_seek(req);
                    pipeline.shared.demux_kick.kick();
                }
            }
            None => {
                log::trace!("video seek to {} ms deferred", pos_ms);
                *self.pending_seek.lock() = Some(req);
            }
        }
        Ok(())
    }

    // ============ Reading ============

    /// Frame shown at `pos_ms`: the converted frame with the greatest
    /// position at or before it, or the previous GOP's last frame.
    ///
    /// With `wait` the call blocks until that frame is known; without it the
    /// best frame converted so far (possibly none) is returned.
    pub fn read_video_frame(&self, pos_ms: i64, wait: bool) -> RfResult<Option<Arc<VideoFrame>>> {
        let mut st = self.state.lock();
        let info = self.check_readable(&st)?;
        if pos_ms < 0 {
            return Err(RfError::InvalidArgument(format!("negative read position {}", pos_ms)));
        }
        if !info.is_image && pos_ms >= info.duration_ms {
            return Err(RfError::InvalidArgument(format!(
                "read position {} beyond duration {}",
                pos_ms, info.duration_ms
            )));
        }
        let pos = if info.is_image { 0 } else { pos_ms };

        if let Some((cached_pos, frame)) = &st.last_frame
            && *cached_pos == pos
        {
            return Ok(Some(frame.clone()));
        }

        let shared = match &st.pipeline {
            Some(pipeline) => pipeline.shared.clone(),
            None => return Err(RfError::NotReady("video pipeline not running".into())),
        };
        if !info.is_image && shared.scheduler.read_pos() != pos {
            shared.scheduler.set_read_pos(pos);
            shared.demux_kick.kick();
        }
        st.read_pos = pos;

        let pts = shared.scheduler.ms_to_pts(pos);
        loop {
            self.interrupt.check()?;
            let seen = shared.progress.generation();
            let seeking = shared.scheduler.params().seeking_mode;
            match lookup_frame(&shared.scheduler, pos) {
                Lookup::Ready(frame) => {
                    if let Some(f) = &frame {
                        st.last_frame = Some((pos, f.clone()));
                    }
                    return Ok(frame);
                }
                Lookup::Pending(frame) => {
                    if !wait || shared.is_fatal() || (seeking && frame.is_some()) {
                        return Ok(frame);
                    }
                    // a parked seek moved the window away: nothing in range
                    // will ever produce `pos`
                    if !info.is_image
                        && shared.scheduler.read_pos() != pos
                        && !shared.scheduler.window().covers_pts(pts)
                    {
                        log::debug!("video read at {} ms abandoned after seek", pos);
                        return Ok(frame);
                    }
                }
            }
            shared.progress.wait_since(seen, shared.idle);
        }
    }

    /// Frame number `index` at the stream's nominal frame rate
    pub fn read_video_frame_by_index(
        &self,
        index: u64,
        wait: bool,
    ) -> RfResult<Option<Arc<VideoFrame>>> {
        let frame_rate = {
            let st = self.state.lock();
            let info = self.check_readable(&st)?;
            info.video.map(|v| v.frame_rate).unwrap_or(Rational::new(25, 1))
        };
        if !frame_rate.is_valid() {
            return Err(RfError::InvalidArgument("stream has no frame rate".into()));
        }
        // index frames of 1/fps seconds each
        let frame_duration = Rational::new(frame_rate.den, frame_rate.num);
        let pos_ms = rescale(index as i64, frame_duration, Rational::MILLIS);
        self.read_video_frame(pos_ms, wait)
    }

    fn check_readable(&self, st: &VideoState) -> RfResult<MediaInfo> {
        if st.closed {
            return Err(RfError::Closed);
        }
        let source = st
            .source
            .as_ref()
            .ok_or_else(|| RfError::NotReady("video reader not open".into()))?;
        if !st.started {
            return Err(RfError::NotReady("video reader not started".into()));
        }
        if st.suspended {
            return Err(RfError::NotReady("video reader suspended".into()));
        }
        Ok(source.info().clone())
    }

    // ============ Introspection ============

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.state.lock().source.as_ref().map(|s| s.info().clone())
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn read_pos(&self) -> i64 {
        if let Some(req) = *self.pending_seek.lock() {
            return req.pos_ms;
        }
        let st = self.state.lock();
        match &st.pipeline {
            Some(pipeline) => pipeline.shared.scheduler.read_pos(),
            None => st.read_pos,
        }
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

    /// Last fatal pipeline error
    pub fn last_error(&self) -> Option<RfError> {
        self.errors.get().map(RfError::Fatal)
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(mut pipeline) = st.pipeline.take() {
            pipeline.stop();
        }
    }
}

fn spawn_video_workers<P>(
    workers: &mut Vec<JoinHandle<()>>,
    shared: &Arc<VideoShared>,
    (demuxer, decoder): (Box<dyn Demuxer>, VideoDecoder),
    options: DecodeOptions,
    position: P,
    (slot, factory): (Arc<VideoOutputSlot>, FrameConverterFactory),
) -> RfResult<()>
where
    P: Fn(i64) -> i64 + Send + 'static,
{
    let s = shared.clone();
    workers.push(spawn_worker("rf-video-demux".into(), move || run_demux(s, demuxer))?);
    let s = shared.clone();
    workers.push(spawn_worker("rf-video-decode".into(), move || {
        run_decode(s, decoder, options, position)
    })?);
    let s = shared.clone();
    workers.push(spawn_worker("rf-video-convert".into(), move || {
        run_video_convert(s, slot, factory)
    })?);
    Ok(())
}

fn lookup_frame(scheduler: &VideoScheduler, pos: i64) -> Lookup {
    let pts = scheduler.ms_to_pts(pos);
    let tasks = scheduler.tasks_by_time();
    let idx = tasks.partition_point(|t| t.start_pts <= pts);
    let Some(target) = idx.checked_sub(1).and_then(|i| tasks.get(i)) else {
        return Lookup::Pending(None);
    };

    if !target.contains_pts(pts) {
        // past the last task: either the window has not caught up yet or
        // the file ended inside `target`
        let probe = target.probe(pos);
        let last = probe.last.map(|(_, f)| f);
        if scheduler.eof_data_end().is_some() && idx == tasks.len() && probe.finished {
            return Lookup::Ready(last);
        }
        return Lookup::Pending(last);
    }

    let probe = target.probe(pos);
    let settled = !probe.blocked && (probe.has_after || probe.finished);
    if let Some((_, frame)) = probe.frame {
        return if settled {
            Lookup::Ready(Some(frame))
        } else {
            Lookup::Pending(Some(frame))
        };
    }

    // nothing at or before `pos` inside this GOP
    let previous = idx.checked_sub(2).and_then(|i| tasks.get(i));
    match previous {
        Some(prev) => {
            let prev_probe = prev.probe(pos);
            let last = prev_probe.last.map(|(_, f)| f);
            if settled && prev_probe.finished {
                Lookup::Ready(last)
            } else {
                Lookup::Pending(last)
            }
        }
        None if settled => Lookup::Ready(None),
        None => Lookup::Pending(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticVideoConfig, SyntheticVideoSource};

    fn started_reader(config: SyntheticVideoConfig) -> VideoReader {
        let reader = VideoReader::new(ReaderConfig::default()).unwrap();
        reader.open(Arc::new(SyntheticVideoSource::new(config))).unwrap();
        reader.configure(VideoOutputConfig::default()).unwrap();
        reader.start(false).unwrap();
        reader
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let reader = VideoReader::new(ReaderConfig::default()).unwrap();
        assert!(matches!(
            reader.configure(VideoOutputConfig::default()),
            Err(RfError::Config(_))
        ));
        reader
            .open(Arc::new(SyntheticVideoSource::new(SyntheticVideoConfig::default())))
            .unwrap();
        assert!(matches!(reader.start(false), Err(RfError::Config(_))));
        assert!(matches!(reader.read_video_frame(0, false), Err(RfError::NotReady(_))));
    }

    #[test]
    fn test_read_bounds() {
        let reader = started_reader(SyntheticVideoConfig::default());
        let duration = reader.media_info().unwrap().duration_ms;
        assert!(matches!(reader.read_video_frame(-1, false), Err(RfError::InvalidArgument(_))));
        assert!(matches!(
            reader.read_video_frame(duration, false),
            Err(RfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_last_frame_cached() {
        let reader = started_reader(SyntheticVideoConfig::default());
        let a = reader.read_video_frame(500, true).unwrap().unwrap();
        let b = reader.read_video_frame(500, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.pos_ms <= 500);
    }

    #[test]
    fn test_closed_reader_rejects_reads() {
        let reader = started_reader(SyntheticVideoConfig::default());
        reader.close();
        assert!(matches!(reader.read_video_frame(0, false), Err(RfError::Closed)));
    }

    #[test]
    fn test_frame_by_index() {
        let reader = started_reader(SyntheticVideoConfig::default());
        // 25 fps: frame 30 starts at 1200 ms
        let frame = reader.read_video_frame_by_index(30, true).unwrap().unwrap();
        assert_eq!(frame.pos_ms, 1200);
    }
}
