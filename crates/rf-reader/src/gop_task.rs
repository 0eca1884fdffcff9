//! GOP task
//!
//! A decode unit covering the stream time range `[start_pts, end_pts)`
//! between two consecutive seek points. The demux thread fills its packet
//! queue, the decode thread turns packets into frame slots, and the convert
//! thread settles each slot with a converted frame. Tasks are shared as
//! `Arc<GopTask>`; eviction only drops the scheduler's reference.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::codec::Packet;

// ============ States ============

/// Demux progress; only ever advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DemuxState {
    NotStarted = 0,
    Active = 1,
    Stopped = 2,
}

impl DemuxState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Active,
            _ => Self::Stopped,
        }
    }
}

/// Decode progress; only ever advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DecodeState {
    NotStarted = 0,
    Active = 1,
    /// End-of-input sent, draining
    InputEof = 2,
    Stopped = 3,
}

impl DecodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Active,
            2 => Self::InputEof,
            _ => Self::Stopped,
        }
    }
}

// ============ Pending Counter ============

/// Reader-wide count of decoded frames still waiting for conversion
#[derive(Debug, Default)]
pub struct PendingCounter {
    value: AtomicI64,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::AcqRel);
    }

    /// Returns false if the counter went negative, which is a bookkeeping defect
    pub fn sub(&self, n: i64) -> bool {
        let prev = self.value.fetch_sub(n, Ordering::AcqRel);
        if prev < n {
            log::error!("pending frame counter underflow: {} - {}", prev, n);
            debug_assert!(prev >= n, "pending frame counter underflow");
            return false;
        }
        true
    }
}

// ============ Frame Slots ============

enum SlotData<D, C> {
    Decoded(D),
    Converting,
    Converted(C),
    Failed,
}

/// One decoded frame and, once settled, its conversion result
pub struct FrameSlot<D, C> {
    /// Stream timestamp
    pub pts: i64,
    /// Output position: milliseconds for video, sample index for audio
    pub pos: i64,
    data: SlotData<D, C>,
}

impl<D, C> FrameSlot<D, C> {
    pub fn converted(&self) -> Option<&C> {
        match &self.data {
            SlotData::Converted(c) => Some(c),
            _ => None,
        }
    }

    /// Converted or failed; nothing more will happen to this slot
    pub fn is_settled(&self) -> bool {
        matches!(self.data, SlotData::Converted(_) | SlotData::Failed)
    }
}

struct TaskFrames<D, C> {
    slots: Vec<FrameSlot<D, C>>,
    pending: i64,
}

/// Result of looking up a position inside one task
#[derive(Debug, Clone)]
pub struct FrameProbe<C> {
    /// Converted frame with the greatest position <= the target
    pub frame: Option<(i64, C)>,
    /// The slot with the greatest position <= the target is not settled yet
    pub blocked: bool,
    /// Some slot lies beyond the target
    pub has_after: bool,
    /// Decoding stopped and every slot settled
    pub finished: bool,
    /// Converted frame with the greatest position overall
    pub last: Option<(i64, C)>,
}

// ============ GOP Task ============

pub struct GopTask<D, C> {
    pub id: u64,
    pub start_pts: i64,
    /// Exclusive; `i64::MAX` for the last GOP of the file
    pub end_pts: i64,
    pub is_file_begin: bool,
    pub is_file_end: bool,

    demux_state: AtomicU8,
    decode_state: AtomicU8,
    cancelled: AtomicBool,

    packets: Mutex<VecDeque<Packet>>,
    packets_total: AtomicUsize,
    frm_pts_range: Mutex<Option<(i64, i64)>>,
    /// Greatest `timestamp + duration` seen
    data_end: AtomicI64,

    frames: Mutex<TaskFrames<D, C>>,
}

impl<D, C: Clone> GopTask<D, C> {
    pub fn new(id: u64, start_pts: i64, end_pts: i64, is_file_begin: bool) -> Self {
        Self {
            id,
            start_pts,
            end_pts,
            is_file_begin,
            is_file_end: end_pts == i64::MAX,
            demux_state: AtomicU8::new(DemuxState::NotStarted as u8),
            decode_state: AtomicU8::new(DecodeState::NotStarted as u8),
            cancelled: AtomicBool::new(false),
            packets: Mutex::new(VecDeque::new()),
            packets_total: AtomicUsize::new(0),
            frm_pts_range: Mutex::new(None),
            data_end: AtomicI64::new(i64::MIN),
            frames: Mutex::new(TaskFrames {
                slots: Vec::new(),
                pending: 0,
            }),
        }
    }

    #[inline]
    pub fn contains_pts(&self, pts: i64) -> bool {
        pts >= self.start_pts && pts < self.end_pts
    }

    // ---- states ----

    pub fn demux_state(&self) -> DemuxState {
        DemuxState::from_u8(self.demux_state.load(Ordering::Acquire))
    }

    pub fn decode_state(&self) -> DecodeState {
        DecodeState::from_u8(self.decode_state.load(Ordering::Acquire))
    }

    pub fn advance_demux(&self, state: DemuxState) {
        self.demux_state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn advance_decode(&self, state: DecodeState) {
        self.decode_state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Drop all buffered packets and frames and release their pending count.
    ///
    /// Threads still holding the task see the flag and let go of it.
    pub fn cancel(&self, pending: &PendingCounter) -> bool {
        let mut frames = self.frames.lock();
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.packets.lock().clear();
        let released = mem::take(&mut frames.pending);
        frames.slots.clear();
        drop(frames);

        log::trace!(
            "task {} [{}, {}) cancelled, {} frames released",
            self.id,
            self.start_pts,
            self.end_pts,
            released
        );
        released == 0 || pending.sub(released)
    }

    // ---- packets ----

    /// Returns false if the task was cancelled
    pub fn push_packet(&self, packet: Packet) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if let Some(ts) = packet.timestamp() {
            let mut range = self.frm_pts_range.lock();
            *range = Some(match *range {
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                None => (ts, ts),
            });
            self.data_end
                .fetch_max(ts.saturating_add(packet.duration.max(0)), Ordering::AcqRel);
        }
        self.packets.lock().push_back(packet);
        self.packets_total.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn pop_packet(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }

    /// Return a packet the decoder could not take yet
    pub fn unpop_packet(&self, packet: Packet) {
        if !self.is_cancelled() {
            self.packets.lock().push_front(packet);
        }
    }

    pub fn queued_packets(&self) -> usize {
        self.packets.lock().len()
    }

    /// Packets ever pushed
    pub fn packets_total(&self) -> usize {
        self.packets_total.load(Ordering::Acquire)
    }

    /// Min and max packet timestamp seen
    pub fn frm_pts_range(&self) -> Option<(i64, i64)> {
        *self.frm_pts_range.lock()
    }

    pub fn data_end(&self) -> Option<i64> {
        let end = self.data_end.load(Ordering::Acquire);
        (end != i64::MIN).then_some(end)
    }

    // ---- frames ----

    /// Store a decoded frame; returns false if the task was cancelled
    pub fn push_frame(&self, pts: i64, pos: i64, frame: D, pending: &PendingCounter) -> bool {
        let mut frames = self.frames.lock();
        if self.is_cancelled() {
            return false;
        }
        frames.slots.push(FrameSlot {
            pts,
            pos,
            data: SlotData::Decoded(frame),
        });
        frames.pending += 1;
        pending.add(1);
        true
    }

    /// Take the earliest decoded frame that has not been converted yet
    pub fn take_unconverted(&self) -> Option<(usize, i64, D)> {
        let mut frames = self.frames.lock();
        let (idx, slot) = frames
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| matches!(s.data, SlotData::Decoded(_)))?;
        match mem::replace(&mut slot.data, SlotData::Converting) {
            SlotData::Decoded(d) => Some((idx, slot.pos, d)),
            _ => None,
        }
    }

    /// Settle slot `idx`; `None` marks a failed conversion.
    ///
    /// Returns false on a pending-count underflow.
    pub fn finish_conversion(&self, idx: usize, result: Option<C>, pending: &PendingCounter) -> bool {
        let mut frames = self.frames.lock();
        if self.is_cancelled() {
            // cancel() already released this slot's count
            return true;
        }
        let Some(slot) = frames.slots.get_mut(idx) else {
            return true;
        };
        if !matches!(slot.data, SlotData::Converting) {
            return true;
        }
        slot.data = match result {
            Some(c) => SlotData::Converted(c),
            None => SlotData::Failed,
        };
        frames.pending -= 1;
        if frames.pending < 0 {
            log::error!("task {} pending frame count underflow", self.id);
            debug_assert!(frames.pending >= 0);
            frames.pending = 0;
            return false;
        }
        pending.sub(1)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().slots.len()
    }

    pub fn converted_count(&self) -> usize {
        self.frames
            .lock()
            .slots
            .iter()
            .filter(|s| s.converted().is_some())
            .count()
    }

    pub fn pending_frames(&self) -> i64 {
        self.frames.lock().pending
    }

    /// Decoding stopped and every frame is converted (or failed)
    pub fn is_ready(&self) -> bool {
        if self.is_cancelled() || self.decode_state() != DecodeState::Stopped {
            return false;
        }
        self.frames.lock().slots.iter().all(FrameSlot::is_settled)
    }

    /// Converted frames in decode order
    pub fn converted_frames(&self) -> Vec<(i64, C)> {
        self.frames
            .lock()
            .slots
            .iter()
            .filter_map(|s| s.converted().map(|c| (s.pos, c.clone())))
            .collect()
    }

    pub fn probe(&self, target: i64) -> FrameProbe<C> {
        let finished_decoding = self.decode_state() == DecodeState::Stopped;
        let frames = self.frames.lock();

        let mut best_pos: Option<(i64, bool)> = None;
        let mut frame: Option<(i64, C)> = None;
        let mut last: Option<(i64, C)> = None;
        let mut has_after = false;
        let mut all_settled = true;

        for slot in &frames.slots {
            all_settled &= slot.is_settled();
            if let Some(c) = slot.converted()
                && last.as_ref().is_none_or(|(p, _)| slot.pos >= *p)
            {
                last = Some((slot.pos, c.clone()));
            }
            if slot.pos > target {
                has_after = true;
                continue;
            }
            if best_pos.is_none_or(|(p, _)| slot.pos >= p) {
                best_pos = Some((slot.pos, slot.is_settled()));
            }
            if let Some(c) = slot.converted()
                && frame.as_ref().is_none_or(|(p, _)| slot.pos >= *p)
            {
                frame = Some((slot.pos, c.clone()));
            }
        }

        FrameProbe {
            frame,
            blocked: best_pos.is_some_and(|(_, settled)| !settled),
            has_after,
            finished: finished_decoding && all_settled && !self.is_cancelled(),
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestTask = GopTask<u32, u32>;

    fn packet(pts: i64) -> Packet {
        Packet {
            pts: Some(pts),
            duration: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_states_only_advance() {
        let task = TestTask::new(1, 0, 100, true);
        task.advance_decode(DecodeState::InputEof);
        task.advance_decode(DecodeState::Active);
        assert_eq!(task.decode_state(), DecodeState::InputEof);

        task.advance_demux(DemuxState::Stopped);
        task.advance_demux(DemuxState::NotStarted);
        assert_eq!(task.demux_state(), DemuxState::Stopped);
    }

    #[test]
    fn test_packet_range() {
        let task = TestTask::new(1, 0, 100, true);
        task.push_packet(packet(20));
        task.push_packet(packet(0));
        task.push_packet(packet(40));
        assert_eq!(task.frm_pts_range(), Some((0, 40)));
        assert_eq!(task.data_end(), Some(50));
        assert_eq!(task.pop_packet().and_then(|p| p.pts), Some(20));
        assert_eq!(task.queued_packets(), 2);
        assert_eq!(task.packets_total(), 3);
    }

    #[test]
    fn test_conversion_releases_pending() {
        let pending = PendingCounter::new();
        let task = TestTask::new(1, 0, 100, true);
        task.push_frame(0, 0, 7, &pending);
        task.push_frame(10, 10, 8, &pending);
        assert_eq!(pending.get(), 2);

        let (idx, pos, decoded) = task.take_unconverted().unwrap();
        assert_eq!((idx, pos, decoded), (0, 0, 7));
        assert!(task.finish_conversion(idx, Some(70), &pending));
        assert_eq!(pending.get(), 1);
        assert_eq!(task.pending_frames(), 1);

        let (idx, _, _) = task.take_unconverted().unwrap();
        assert!(task.finish_conversion(idx, None, &pending));
        assert_eq!(pending.get(), 0);
        assert!(task.take_unconverted().is_none());

        assert!(!task.is_ready());
        task.advance_decode(DecodeState::Stopped);
        assert!(task.is_ready());
        assert_eq!(task.converted_frames(), vec![(0, 70)]);
    }

    #[test]
    fn test_cancel_releases_everything() {
        let pending = PendingCounter::new();
        let task = TestTask::new(1, 0, 100, false);
        task.push_packet(packet(0));
        task.push_frame(0, 0, 1, &pending);
        task.push_frame(10, 10, 2, &pending);
        let (idx, _, _) = task.take_unconverted().unwrap();

        assert!(task.cancel(&pending));
        assert_eq!(pending.get(), 0);
        assert_eq!(task.queued_packets(), 0);
        assert_eq!(task.frame_count(), 0);

        // a conversion finishing after cancel must not release twice
        assert!(task.finish_conversion(idx, Some(10), &pending));
        assert_eq!(pending.get(), 0);
        assert!(!task.push_packet(packet(20)));
        assert!(!task.push_frame(20, 20, 3, &pending));
    }

    #[test]
    fn test_probe() {
        let pending = PendingCounter::new();
        let task = TestTask::new(1, 0, 100, true);
        for pos in [0, 40, 80] {
            task.push_frame(pos, pos, pos as u32, &pending);
        }
        for _ in 0..2 {
            let (idx, pos, _) = task.take_unconverted().unwrap();
            task.finish_conversion(idx, Some(pos as u32), &pending);
        }

        let probe = task.probe(50);
        assert_eq!(probe.frame, Some((40, 40)));
        assert!(!probe.blocked);
        assert!(probe.has_after);
        assert!(!probe.finished);

        // frame at 80 decoded but not converted
        let probe = task.probe(90);
        assert!(probe.blocked);
        assert_eq!(probe.last, Some((40, 40)));
    }
}
