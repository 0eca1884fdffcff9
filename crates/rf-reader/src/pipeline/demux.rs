//! Demux thread: fills task packet queues in priority order

use std::sync::Arc;

use crate::codec::{CodecError, Demuxer, Packet};
use crate::gop_task::{DemuxState, GopTask};

use super::PipelineShared;

pub(crate) fn run_demux<D, C: Clone>(shared: Arc<PipelineShared<D, C>>, mut demuxer: Box<dyn Demuxer>) {
    log::debug!("demux thread started (stream {})", shared.stream_index);
    let scheduler = &shared.scheduler;

    let mut current: Option<Arc<GopTask<D, C>>> = None;
    // end of the last task demuxed to completion; the demuxer sits right after it
    let mut last_end: Option<i64> = None;
    // packets read for the last task that also belong to the next one: the
    // first packet past its end, preceded by a key packet straddling the end
    let mut carry: Vec<Packet> = Vec::new();

    while !shared.should_stop() {
        scheduler.tick();

        if current.as_ref().is_some_and(|t| t.is_cancelled()) {
            current = None;
            last_end = None;
            carry.clear();
        }

        let task = match &current {
            Some(task) => task.clone(),
            None => {
                let Some(next) = scheduler.next_demux_task() else {
                    shared.demux_kick.wait(shared.idle);
                    continue;
                };
                if last_end != Some(next.start_pts) {
                    carry.clear();
                    if let Err(e) = demuxer.seek(shared.stream_index, next.start_pts) {
                        log::warn!("demux seek to {} failed: {}", next.start_pts, e);
                    }
                }
                next.advance_demux(DemuxState::Active);
                for packet in carry.drain(..) {
                    next.push_packet(packet);
                }
                log::trace!("demux task {} [{}, {})", next.id, next.start_pts, next.end_pts);
                current = Some(next.clone());
                shared.decode_kick.kick();
                next
            }
        };

        match demuxer.read_packet() {
            Ok(packet) => {
                if packet.stream_index != shared.stream_index {
                    continue;
                }
                if let Some(ts) = packet.timestamp()
                    && ts >= task.end_pts
                {
                    task.advance_demux(DemuxState::Stopped);
                    last_end = Some(task.end_pts);
                    carry.push(packet);
                    current = None;
                } else {
                    if straddles_end(&packet, task.end_pts) {
                        carry.push(packet.clone());
                    }
                    task.push_packet(packet);
                }
                shared.decode_kick.kick();
            }
            Err(CodecError::Again) => {}
            Err(CodecError::Eof) => {
                task.advance_demux(DemuxState::Stopped);
                if !task.is_file_end {
                    log::warn!(
                        "end of file inside task [{}, {}), expected more seek points",
                        task.start_pts,
                        task.end_pts
                    );
                }
                scheduler.truncate_at_eof(&task);
                current = None;
                last_end = None;
                carry.clear();
                shared.decode_kick.kick();
                shared.progress.notify();
            }
            Err(CodecError::InvalidData(msg)) => {
                log::warn!("skipping unreadable packet: {}", msg);
            }
            Err(CodecError::Other(msg)) => {
                shared.record_fatal("demux", msg);
                break;
            }
        }
    }

    log::debug!("demux thread exit");
}

/// A key packet that starts inside the task but plays past its end. Audio
/// packets rarely line up with task boundaries, so both tasks decode it.
fn straddles_end(packet: &Packet, end_pts: i64) -> bool {
    packet.is_key
        && packet.duration > 0
        && packet
            .timestamp()
            .is_some_and(|ts| ts < end_pts && ts.saturating_add(packet.duration) > end_pts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pts: i64, duration: i64, is_key: bool) -> Packet {
        Packet {
            pts: Some(pts),
            duration,
            is_key,
            ..Default::default()
        }
    }

    #[test]
    fn test_straddling_packet_detection() {
        assert!(straddles_end(&packet(47104, 1024, true), 48000));
        assert!(!straddles_end(&packet(46080, 1024, true), 48000));
        assert!(!straddles_end(&packet(47104, 1024, false), 48000));
        assert!(!straddles_end(&packet(47104, 1024, true), i64::MAX));
    }
}
