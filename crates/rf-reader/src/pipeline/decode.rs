//! Decode thread: one task at a time, each decoded as an independent run
//!
//! A task's packets are fed until the demuxer is done with it, then the
//! decoder gets end-of-input, is drained and flushed before the next task.

use std::sync::Arc;

use crate::codec::{CodecError, DecodedFrame, Decoder};
use crate::gop_task::{DecodeState, DemuxState, GopTask};

use super::PipelineShared;

#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodeOptions {
    /// Pause while this many frames wait for conversion
    pub max_pending: Option<i64>,
    /// Drop frames whose pts falls outside the task range
    pub clip_to_task: bool,
}

enum Step {
    Continue,
    TaskDone,
    Fatal(String),
}

pub(crate) fn run_decode<D, C, P>(
    shared: Arc<PipelineShared<D, C>>,
    mut decoder: Box<dyn Decoder<D>>,
    options: DecodeOptions,
    position: P,
) where
    D: DecodedFrame,
    C: Clone,
    P: Fn(i64) -> i64,
{
    log::debug!("decode thread started (stream {})", shared.stream_index);
    let scheduler = &shared.scheduler;
    let mut current: Option<Arc<GopTask<D, C>>> = None;

    while !shared.should_stop() {
        if current.as_ref().is_some_and(|t| t.is_cancelled()) {
            decoder.flush();
            current = None;
        }

        let task = match &current {
            Some(task) => task.clone(),
            None => {
                let Some(next) = scheduler.next_decode_task() else {
                    shared.decode_kick.wait(shared.idle);
                    continue;
                };
                next.advance_decode(DecodeState::Active);
                log::trace!("decode task {} [{}, {})", next.id, next.start_pts, next.end_pts);
                current = Some(next.clone());
                next
            }
        };

        if let Some(max) = options.max_pending
            && scheduler.pending().get() >= max
        {
            shared.convert_kick.kick();
            shared.decode_kick.wait(shared.idle);
            continue;
        }

        match step(&shared, &task, decoder.as_mut(), options, &position) {
            Step::Continue => {}
            Step::TaskDone => {
                decoder.flush();
                task.advance_decode(DecodeState::Stopped);
                current = None;
                shared.convert_kick.kick();
                shared.progress.notify();
            }
            Step::Fatal(msg) => {
                task.advance_decode(DecodeState::Stopped);
                shared.record_fatal("decode", msg);
                break;
            }
        }
    }

    log::debug!("decode thread exit");
}

fn step<D, C, P>(
    shared: &PipelineShared<D, C>,
    task: &GopTask<D, C>,
    decoder: &mut dyn Decoder<D>,
    options: DecodeOptions,
    position: &P,
) -> Step
where
    D: DecodedFrame,
    C: Clone,
    P: Fn(i64) -> i64,
{
    // drain output first
    match decoder.receive_frame() {
        Ok(frame) => {
            store_frame(shared, task, frame, options, position);
            return Step::Continue;
        }
        Err(CodecError::Again) => {}
        Err(CodecError::Eof) => return Step::TaskDone,
        Err(CodecError::InvalidData(msg)) => {
            log::warn!("decoder dropped a corrupt frame: {}", msg);
            return Step::Continue;
        }
        Err(CodecError::Other(msg)) => return Step::Fatal(msg),
    }

    if task.decode_state() == DecodeState::InputEof {
        // drained without an explicit EOF
        return Step::TaskDone;
    }

    let Some(packet) = task.pop_packet() else {
        if task.demux_state() == DemuxState::Stopped {
            return match decoder.send_packet(None) {
                Ok(()) | Err(CodecError::Eof) => {
                    task.advance_decode(DecodeState::InputEof);
                    Step::Continue
                }
                Err(CodecError::Again) => Step::Continue,
                Err(CodecError::InvalidData(msg)) => {
                    log::warn!("decoder rejected end of input: {}", msg);
                    Step::TaskDone
                }
                Err(CodecError::Other(msg)) => Step::Fatal(msg),
            };
        }
        shared.decode_kick.wait(shared.idle);
        return Step::Continue;
    };

    match decoder.send_packet(Some(&packet)) {
        Ok(()) => Step::Continue,
        Err(CodecError::Again) => {
            task.unpop_packet(packet);
            Step::Continue
        }
        Err(CodecError::Eof) => {
            // decoder still in end-of-input mode from an earlier run
            decoder.flush();
            task.unpop_packet(packet);
            Step::Continue
        }
        Err(CodecError::InvalidData(msg)) => {
            log::warn!("skipping corrupt packet {:?}: {}", packet.timestamp(), msg);
            Step::Continue
        }
        Err(CodecError::Other(msg)) => Step::Fatal(msg),
    }
}

fn store_frame<D, C, P>(
    shared: &PipelineShared<D, C>,
    task: &GopTask<D, C>,
    frame: D,
    options: DecodeOptions,
    position: &P,
) where
    D: DecodedFrame,
    C: Clone,
    P: Fn(i64) -> i64,
{
    let Some(pts) = frame.pts() else {
        log::trace!("dropping frame without timestamp");
        return;
    };

    if let Some((lo, hi)) = task.frm_pts_range()
        && (pts < lo || pts > hi)
    {
        log::trace!("task {} decoded pts {} outside packet range [{}, {}]", task.id, pts, lo, hi);
    }

    if options.clip_to_task {
        let before_start = pts < task.start_pts && !task.is_file_begin;
        if before_start || pts >= task.end_pts {
            log::trace!("task {} drops frame at {} outside its range", task.id, pts);
            return;
        }
    }

    if task.push_frame(pts, position(pts), frame, shared.scheduler.pending()) {
        shared.convert_kick.kick();
    }
}
