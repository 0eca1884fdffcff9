//! Convert threads: settle decoded frames in task priority order

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use rf_core::{AudioFormat, pts_to_seconds};

use crate::codec::{DecodedAudioFrame, DecodedVideoFrame};
use crate::config::VideoOutputConfig;
use crate::convert::{AudioConverter, FrameConverterFactory, Resampler};
use crate::frame::{AudioPcm, VideoFrame};
use crate::gop_task::GopTask;

use super::PipelineShared;

/// Output configuration shared with the reader, versioned so the convert
/// thread notices changes
#[derive(Debug, Default)]
pub(crate) struct VideoOutputSlot {
    inner: Mutex<(u64, VideoOutputConfig)>,
}

impl VideoOutputSlot {
    pub fn get(&self) -> (u64, VideoOutputConfig) {
        *self.inner.lock()
    }

    pub fn set(&self, config: VideoOutputConfig) {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        inner.1 = config;
    }
}

/// Run `convert_one` over every unconverted frame, highest-priority task first
fn drain_tasks<D, C, F>(shared: &PipelineShared<D, C>, mut convert_one: F) -> bool
where
    C: Clone,
    F: FnMut(&GopTask<D, C>, i64, D) -> Option<C>,
{
    let mut worked = false;
    for task in shared.scheduler.tasks_by_priority() {
        if task.is_cancelled() {
            continue;
        }
        while let Some((idx, pos, decoded)) = task.take_unconverted() {
            let result = convert_one(task.as_ref(), pos, decoded);
            if !task.finish_conversion(idx, result, shared.scheduler.pending()) {
                shared.errors.set("pending frame counter underflow");
            }
            worked = true;
            shared.progress.notify();
            if shared.should_stop() {
                return worked;
            }
        }
    }
    worked
}

pub(crate) fn run_video_convert(
    shared: Arc<PipelineShared<DecodedVideoFrame, Arc<VideoFrame>>>,
    output: Arc<VideoOutputSlot>,
    factory: FrameConverterFactory,
) {
    log::debug!("video convert thread started");
    let mut converter = factory();
    let mut applied = 0u64;
    let timing = shared.scheduler.timing().clone();

    while !shared.should_stop() {
        let (version, config) = output.get();
        if version != applied {
            if let Err(e) = converter.set_output(config) {
                shared.record_fatal("convert", e);
                break;
            }
            applied = version;
        }

        let worked = drain_tasks(&shared, |task, pos, decoded| {
            let pts = decoded.pts.unwrap_or(task.start_pts);
            let seconds = pts_to_seconds(pts - timing.start_pts, timing.time_base);
            match converter.convert(&decoded, seconds) {
                Ok(mut frame) => {
                    frame.pos_ms = pos;
                    frame.pts = pts;
                    Some(Arc::new(frame))
                }
                Err(e) => {
                    log::warn!("frame conversion failed at pts {}: {}", pts, e);
                    None
                }
            }
        });

        if !worked {
            shared.convert_kick.wait(shared.idle);
        }
    }

    log::debug!("video convert thread exit");
}

pub(crate) fn run_audio_convert(
    shared: Arc<PipelineShared<DecodedAudioFrame, Arc<AudioPcm>>>,
    output: AudioFormat,
    resampler: Box<dyn Resampler>,
    dump_path: Option<PathBuf>,
) {
    log::debug!("audio convert thread started");
    let mut converter = AudioConverter::new(output, resampler);
    let mut dump = dump_path.and_then(|path| open_dump(&path));

    while !shared.should_stop() {
        let worked = drain_tasks(&shared, |_, _, decoded| {
            let pts = decoded.pts;
            match converter.convert(decoded) {
                Ok(pcm) => {
                    let mut failed = false;
                    if let Some(file) = dump.as_mut() {
                        if let Err(e) = file.write_all(&pcm) {
                            log::warn!("PCM dump disabled: {}", e);
                            failed = true;
                        }
                    }
                    if failed {
                        dump = None;
                    }
                    Some(Arc::new(AudioPcm::new(output, pcm)))
                }
                Err(e) => {
                    log::warn!("audio conversion failed at pts {:?}: {}", pts, e);
                    None
                }
            }
        });

        if !worked {
            shared.convert_kick.wait(shared.idle);
        }
    }

    if let Some(mut file) = dump
        && let Err(e) = file.flush()
    {
        log::warn!("PCM dump flush failed: {}", e);
    }
    log::debug!("audio convert thread exit");
}

fn open_dump(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            log::info!("dumping converted PCM to {}", path.display());
            Some(file)
        }
        Err(e) => {
            log::warn!("cannot open PCM dump {}: {}", path.display(), e);
            None
        }
    }
}
