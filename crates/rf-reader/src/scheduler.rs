//! Task scheduler
//!
//! Owns the cache window and the GOP tasks covering it. Tasks live in two
//! lists guarded by separate locks, never held together:
//!
//! - `by_time`: sorted by `start_pts`, contiguous, used for lookups
//! - `by_priority`: the order the worker threads pick tasks in; the task
//!   under the read head first, then the look-ahead side in travel order,
//!   then the look-behind side
//!
//! Window and task-list changes are serialized by `build_lock`. A seek that
//! cannot take the reader's API lock is parked in the shared pending-seek
//! slot and applied by the demux thread on its next tick.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use rf_core::{Direction, Rational, ms_to_pts, pts_to_ms};

use crate::cache_window::{CacheWindow, WindowParams};
use crate::gop_task::{DecodeState, DemuxState, GopTask, PendingCounter};
use crate::seek_points::SeekPointTable;

/// A seek parked for the demux thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub pos_ms: i64,
    /// Scrubbing: cache only the GOP under the read head
    pub seeking_mode: bool,
}

/// Slot shared between a reader's API and its pipeline
pub type PendingSeek = Arc<Mutex<Option<SeekRequest>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerParams {
    pub direction: Direction,
    pub forward_ms: i64,
    pub backward_ms: i64,
    pub seeking_mode: bool,
}

/// Stream-level constants the scheduler works in
#[derive(Debug, Clone)]
pub struct StreamTiming {
    pub time_base: Rational,
    pub start_pts: i64,
    pub duration_ms: i64,
}

pub struct TaskScheduler<D, C> {
    name: &'static str,
    table: SeekPointTable,
    timing: StreamTiming,

    params: Mutex<SchedulerParams>,
    window: Mutex<CacheWindow>,
    by_time: Mutex<Vec<Arc<GopTask<D, C>>>>,
    by_priority: Mutex<Vec<Arc<GopTask<D, C>>>>,
    build_lock: Mutex<()>,
    pending_seek: PendingSeek,

    read_pos: AtomicI64,
    force_update: AtomicBool,
    /// Tasks never start at or after this pts; set when the demuxer hits EOF
    eof_limit: AtomicI64,
    /// End of the last packet before EOF
    eof_data_end: AtomicI64,
    next_id: AtomicU64,
    generation: AtomicU64,
    pending: Arc<PendingCounter>,
}

impl<D, C: Clone> TaskScheduler<D, C> {
    pub fn new(
        name: &'static str,
        table: SeekPointTable,
        timing: StreamTiming,
        params: SchedulerParams,
        pending_seek: PendingSeek,
    ) -> Self {
        Self {
            name,
            table,
            timing,
            params: Mutex::new(params),
            window: Mutex::new(CacheWindow::default()),
            by_time: Mutex::new(Vec::new()),
            by_priority: Mutex::new(Vec::new()),
            build_lock: Mutex::new(()),
            pending_seek,
            read_pos: AtomicI64::new(0),
            force_update: AtomicBool::new(false),
            eof_limit: AtomicI64::new(i64::MAX),
            eof_data_end: AtomicI64::new(i64::MAX),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            pending: Arc::new(PendingCounter::new()),
        }
    }

    // ============ Accessors ============

    pub fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    pub fn timing(&self) -> &StreamTiming {
        &self.timing
    }

    pub fn seek_points(&self) -> &SeekPointTable {
        &self.table
    }

    pub fn window(&self) -> CacheWindow {
        *self.window.lock()
    }

    pub fn params(&self) -> SchedulerParams {
        *self.params.lock()
    }

    pub fn direction(&self) -> Direction {
        self.params.lock().direction
    }

    pub fn read_pos(&self) -> i64 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Bumped whenever the task list changes
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn eof_data_end(&self) -> Option<i64> {
        let end = self.eof_data_end.load(Ordering::Acquire);
        (end != i64::MAX).then_some(end)
    }

    #[inline]
    pub fn ms_to_pts(&self, ms: i64) -> i64 {
        self.timing.start_pts + ms_to_pts(ms, self.timing.time_base)
    }

    #[inline]
    pub fn pts_to_ms(&self, pts: i64) -> i64 {
        pts_to_ms(pts - self.timing.start_pts, self.timing.time_base)
    }

    fn window_params(&self) -> WindowParams {
        let p = self.params.lock();
        let (forward_ms, backward_ms) = if p.seeking_mode {
            (0, 0)
        } else {
            (p.forward_ms, p.backward_ms)
        };
        WindowParams {
            time_base: self.timing.time_base,
            start_pts: self.timing.start_pts,
            duration_ms: self.timing.duration_ms,
            direction: p.direction,
            forward_ms,
            backward_ms,
        }
    }

    pub fn tasks_by_time(&self) -> Vec<Arc<GopTask<D, C>>> {
        self.by_time.lock().clone()
    }

    pub fn tasks_by_priority(&self) -> Vec<Arc<GopTask<D, C>>> {
        self.by_priority.lock().clone()
    }

    pub fn task_count(&self) -> usize {
        self.by_time.lock().len()
    }

    /// Task whose range contains `pts`
    pub fn task_at(&self, pts: i64) -> Option<Arc<GopTask<D, C>>> {
        let list = self.by_time.lock();
        let idx = list.partition_point(|t| t.start_pts <= pts);
        let task = list.get(idx.checked_sub(1)?)?;
        task.contains_pts(pts).then(|| task.clone())
    }

    /// Highest-priority task the demux thread has not started
    pub fn next_demux_task(&self) -> Option<Arc<GopTask<D, C>>> {
        self.by_priority
            .lock()
            .iter()
            .find(|t| !t.is_cancelled() && t.demux_state() == DemuxState::NotStarted)
            .cloned()
    }

    /// Highest-priority task with packets flowing and no decoder yet
    pub fn next_decode_task(&self) -> Option<Arc<GopTask<D, C>>> {
        self.by_priority
            .lock()
            .iter()
            .find(|t| {
                !t.is_cancelled()
                    && t.demux_state() != DemuxState::NotStarted
                    && t.decode_state() == DecodeState::NotStarted
            })
            .cloned()
    }

    // ============ Parameter Changes ============

    /// Move the read head; the window follows on the next tick
    pub fn set_read_pos(&self, ms: i64) {
        self.read_pos.store(ms, Ordering::Release);
    }

    pub fn set_direction(&self, direction: Direction) {
        {
            let mut p = self.params.lock();
            if p.direction == direction {
                return;
            }
            p.direction = direction;
        }
        self.force_update.store(true, Ordering::Release);
        let _build = self.build_lock.lock();
        self.rebuild_priority();
    }

    pub fn set_cache_duration(&self, forward_ms: i64, backward_ms: i64) {
        {
            let mut p = self.params.lock();
            p.forward_ms = forward_ms;
            p.backward_ms = backward_ms;
        }
        self.reset_build_task();
    }

    /// Apply a seek synchronously
    pub fn apply_seek(&self, req: SeekRequest) {
        let _build = self.build_lock.lock();
        self.apply_seek_locked(req);
    }

    fn apply_seek_locked(&self, req: SeekRequest) {
        log::debug!("{} scheduler: seek to {} ms (seeking mode {})", self.name, req.pos_ms, req.seeking_mode);
        self.read_pos.store(req.pos_ms, Ordering::Release);
        self.params.lock().seeking_mode = req.seeking_mode;
        let params = self.window_params();
        let changed = self.window.lock().update(req.pos_ms, &params, &self.table, false);
        if changed {
            self.update_build_task_locked();
        } else {
            self.rebuild_priority();
        }
    }

    /// Periodic update from the demux thread.
    ///
    /// Applies a parked seek, then moves the window to the read head and
    /// updates tasks when the window's seek bounds changed.
    pub fn tick(&self) {
        let _build = self.build_lock.lock();
        if let Some(req) = self.pending_seek.lock().take() {
            self.apply_seek_locked(req);
            return;
        }

        let force = self.force_update.swap(false, Ordering::AcqRel);
        let pos = self.read_pos();
        let params = self.window_params();
        let (changed, head_moved) = {
            let mut window = self.window.lock();
            let prev = window.seek_pos_at_read;
            let changed = window.update(pos, &params, &self.table, force);
            (changed, prev != window.seek_pos_at_read)
        };
        if changed {
            self.update_build_task_locked();
        } else if head_moved {
            self.rebuild_priority();
        }
    }

    // ============ Task Building ============

    /// Drop every task and rebuild from the current read head
    pub fn reset_build_task(&self) {
        let _build = self.build_lock.lock();
        let params = self.window_params();
        let window = CacheWindow::compute(self.read_pos(), &params, &self.table);
        *self.window.lock() = window;

        let end = window.seek_pos_at_end.min(self.eof_limit.load(Ordering::Acquire));
        let fresh = self.build_range(window.seek_pos_at_begin, end);
        let evicted = mem::replace(&mut *self.by_time.lock(), fresh);
        for task in &evicted {
            task.cancel(&self.pending);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.rebuild_priority();
        log::debug!(
            "{} scheduler: reset, {} tasks over [{}, {})",
            self.name,
            self.task_count(),
            window.seek_pos_at_begin,
            end
        );
    }

    /// Incremental update after the window moved: evict tasks that left
    /// the window and add tasks for newly covered GOPs at either end.
    fn update_build_task_locked(&self) {
        let window = self.window();
        let begin = window.seek_pos_at_begin;
        let end = window.seek_pos_at_end.min(self.eof_limit.load(Ordering::Acquire));

        let mut evicted = Vec::new();
        let mut added = 0usize;
        {
            let mut list = self.by_time.lock();
            let overlaps = match (list.first(), list.last()) {
                (Some(first), Some(last)) => end > first.start_pts && begin < last.end_pts,
                _ => false,
            };

            if !overlaps {
                evicted.append(&mut *list);
                *list = self.build_range(begin, end);
                added = list.len();
            } else {
                while list.first().is_some_and(|t| t.end_pts <= begin) {
                    evicted.push(list.remove(0));
                }
                while list.last().is_some_and(|t| t.start_pts >= end) {
                    if let Some(t) = list.pop() {
                        evicted.push(t);
                    }
                }
                if let Some(first_start) = list.first().map(|t| t.start_pts)
                    && begin < first_start
                {
                    let front = self.build_range(begin, first_start);
                    added += front.len();
                    list.splice(0..0, front);
                }
                if let Some(last_end) = list.last().map(|t| t.end_pts)
                    && last_end < end
                {
                    let back = self.build_range(last_end, end);
                    added += back.len();
                    list.extend(back);
                }
                if list.is_empty() {
                    *list = self.build_range(begin, end);
                    added = list.len();
                }
            }
        }

        for task in &evicted {
            task.cancel(&self.pending);
        }
        if added > 0 || !evicted.is_empty() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            log::trace!(
                "{} scheduler: window [{}, {}) +{} -{} tasks",
                self.name,
                begin,
                end,
                added,
                evicted.len()
            );
        }
        self.rebuild_priority();
    }

    /// Tasks for consecutive seek points from `from` up to `to`
    fn build_range(&self, from: i64, to: i64) -> Vec<Arc<GopTask<D, C>>> {
        let mut out = Vec::new();
        let mut start = from;
        while start < to {
            let end = self.table.next_after(start);
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let is_file_begin = self.table.first().is_none_or(|first| start <= first);
            out.push(Arc::new(GopTask::new(id, start, end, is_file_begin)));
            if end == i64::MAX {
                break;
            }
            start = end;
        }
        out
    }

    fn rebuild_priority(&self) {
        let tasks = self.tasks_by_time();
        let read_pts = self.ms_to_pts(self.read_pos());
        let direction = self.direction();

        let mut order = Vec::with_capacity(tasks.len());
        if !tasks.is_empty() {
            let anchor = tasks
                .partition_point(|t| t.start_pts <= read_pts)
                .saturating_sub(1);
            order.push(tasks[anchor].clone());
            let ahead = tasks[anchor + 1..].iter().cloned();
            let behind = tasks[..anchor].iter().rev().cloned();
            match direction {
                Direction::Forward => {
                    order.extend(ahead);
                    order.extend(behind);
                }
                Direction::Backward => {
                    order.extend(behind);
                    order.extend(ahead);
                }
            }
        }
        order.retain(|t| !t.is_cancelled());
        *self.by_priority.lock() = order;
    }

    // ============ End Of File ============

    /// The demuxer hit end of file inside `task`: nothing can exist after
    /// it, so cancel and evict every later task (and `task` itself when it
    /// received no packet).
    pub fn truncate_at_eof(&self, task: &GopTask<D, C>) {
        let _build = self.build_lock.lock();
        let had_data = task.packets_total() > 0;
        let limit = if had_data { task.end_pts } else { task.start_pts };
        self.eof_limit.fetch_min(limit, Ordering::AcqRel);
        let data_end = task.data_end().unwrap_or(task.start_pts);
        self.eof_data_end.fetch_min(data_end, Ordering::AcqRel);

        let mut evicted = Vec::new();
        self.by_time.lock().retain(|t| {
            let keep = t.start_pts < limit;
            if !keep {
                evicted.push(t.clone());
            }
            keep
        });
        for t in &evicted {
            t.cancel(&self.pending);
        }
        if !evicted.is_empty() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            log::debug!(
                "{} scheduler: end of file at pts {}, evicted {} tasks",
                self.name,
                limit,
                evicted.len()
            );
        }
        self.rebuild_priority();
    }

    /// Cancel everything; used when the pipeline stops
    pub fn cancel_all(&self) {
        let _build = self.build_lock.lock();
        let evicted = mem::take(&mut *self.by_time.lock());
        self.by_priority.lock().clear();
        for t in &evicted {
            t.cancel(&self.pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestScheduler = TaskScheduler<u32, u32>;

    fn scheduler(direction: Direction) -> TestScheduler {
        // ten one-second GOPs, millisecond time base
        TaskScheduler::new(
            "test",
            SeekPointTable::uniform(0, 1000, 10_000),
            StreamTiming {
                time_base: Rational::MILLIS,
                start_pts: 0,
                duration_ms: 10_000,
            },
            SchedulerParams {
                direction,
                forward_ms: 1500,
                backward_ms: 500,
                seeking_mode: false,
            },
            Arc::new(Mutex::new(None)),
        )
    }

    fn starts(tasks: &[Arc<GopTask<u32, u32>>]) -> Vec<i64> {
        tasks.iter().map(|t| t.start_pts).collect()
    }

    #[test]
    fn test_reset_covers_window() {
        let s = scheduler(Direction::Forward);
        s.set_read_pos(2000);
        s.reset_build_task();
        assert_eq!(starts(&s.tasks_by_time()), vec![1000, 2000, 3000]);
        assert_eq!(starts(&s.tasks_by_priority()), vec![2000, 3000, 1000]);
    }

    #[test]
    fn test_backward_priority() {
        let s = scheduler(Direction::Backward);
        s.set_read_pos(5000);
        s.reset_build_task();
        // backward: 1.5s behind the travel direction is earlier media time
        assert_eq!(starts(&s.tasks_by_time()), vec![3000, 4000, 5000]);
        assert_eq!(starts(&s.tasks_by_priority()), vec![5000, 4000, 3000]);
    }

    #[test]
    fn test_incremental_update_keeps_tasks() {
        let s = scheduler(Direction::Forward);
        s.set_read_pos(2000);
        s.reset_build_task();
        let before = s.tasks_by_time();

        s.set_read_pos(3000);
        s.tick();
        let after = s.tasks_by_time();
        assert_eq!(starts(&after), vec![2000, 3000, 4000]);
        // the surviving tasks are the same objects
        assert_eq!(after[0].id, before[1].id);
        assert_eq!(after[1].id, before[2].id);
        assert!(before[0].is_cancelled());
    }

    #[test]
    fn test_tick_is_idempotent() {
        let s = scheduler(Direction::Forward);
        s.set_read_pos(2000);
        s.reset_build_task();
        s.tick();
        let generation = s.generation();
        let ids: Vec<u64> = s.tasks_by_time().iter().map(|t| t.id).collect();

        s.tick();
        s.set_read_pos(2100);
        s.tick();
        assert_eq!(s.generation(), generation);
        let again: Vec<u64> = s.tasks_by_time().iter().map(|t| t.id).collect();
        assert_eq!(ids, again);
    }

    #[test]
    fn test_far_seek_rebuilds() {
        let s = scheduler(Direction::Forward);
        s.set_read_pos(0);
        s.reset_build_task();
        s.apply_seek(SeekRequest {
            pos_ms: 8000,
            seeking_mode: false,
        });
        assert_eq!(starts(&s.tasks_by_time()), vec![7000, 8000, 9000]);
        assert_eq!(s.task_at(9500).map(|t| t.is_file_end), Some(true));
    }

    #[test]
    fn test_seeking_mode_caches_one_gop() {
        let s = scheduler(Direction::Forward);
        s.apply_seek(SeekRequest {
            pos_ms: 4200,
            seeking_mode: true,
        });
        assert_eq!(starts(&s.tasks_by_time()), vec![4000]);
    }

    #[test]
    fn test_pending_seek_applied_on_tick() {
        let slot: PendingSeek = Arc::new(Mutex::new(None));
        let s: TestScheduler = TaskScheduler::new(
            "test",
            SeekPointTable::uniform(0, 1000, 10_000),
            StreamTiming {
                time_base: Rational::MILLIS,
                start_pts: 0,
                duration_ms: 10_000,
            },
            SchedulerParams {
                direction: Direction::Forward,
                forward_ms: 1000,
                backward_ms: 0,
                seeking_mode: false,
            },
            slot.clone(),
        );
        *slot.lock() = Some(SeekRequest {
            pos_ms: 6000,
            seeking_mode: false,
        });
        s.tick();
        assert!(slot.lock().is_none());
        assert_eq!(s.read_pos(), 6000);
        assert!(s.task_at(6000).is_some());
    }

    #[test]
    fn test_truncate_at_eof() {
        let s = scheduler(Direction::Forward);
        s.set_read_pos(2000);
        s.reset_build_task();
        let tasks = s.tasks_by_time();

        // the GOP at 2000 turns out to be the last one with data
        tasks[1].push_packet(crate::codec::Packet {
            pts: Some(2500),
            duration: 40,
            ..Default::default()
        });
        s.truncate_at_eof(&tasks[1]);
        assert_eq!(starts(&s.tasks_by_time()), vec![1000, 2000]);
        assert!(tasks[2].is_cancelled());
        assert_eq!(s.eof_data_end(), Some(2540));

        // later windows never reach past the end
        s.set_read_pos(2900);
        s.tick();
        assert!(s.tasks_by_time().iter().all(|t| t.start_pts < 3000));
    }
}
