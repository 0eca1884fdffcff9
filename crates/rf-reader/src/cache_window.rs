//! Cache window
//!
//! The span of media time kept decoded around the read head, plus the seek
//! points bracketing it. The window stretches further in the travel
//! direction: `forward_ms` ahead and `backward_ms` behind the read head.

use rf_core::{Direction, Rational, ms_to_pts};

use crate::seek_points::SeekPointTable;

/// Inputs of a window computation that do not change per read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub time_base: Rational,
    pub start_pts: i64,
    pub duration_ms: i64,
    pub direction: Direction,
    /// Look-ahead in the travel direction
    pub forward_ms: i64,
    /// Look-behind against the travel direction
    pub backward_ms: i64,
}

impl WindowParams {
    #[inline]
    pub fn ms_to_stream_pts(&self, ms: i64) -> i64 {
        self.start_pts + ms_to_pts(ms, self.time_base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheWindow {
    /// Read head (ms)
    pub read_pos: i64,
    /// First cached millisecond
    pub cache_begin: i64,
    /// Last cached millisecond
    pub cache_end: i64,
    /// Seek points bracketing the read head
    pub seek_pos_at_read: (i64, i64),
    /// Seek point at or before `cache_begin`
    pub seek_pos_at_begin: i64,
    /// Seek point after `cache_end`, `i64::MAX` for end of file
    pub seek_pos_at_end: i64,
}

impl CacheWindow {
    pub fn compute(read_pos: i64, params: &WindowParams, table: &SeekPointTable) -> Self {
        let (behind, ahead) = match params.direction {
            Direction::Forward => (params.backward_ms, params.forward_ms),
            Direction::Backward => (params.forward_ms, params.backward_ms),
        };
        let max = params.duration_ms.max(0);
        let cache_begin = read_pos.saturating_sub(behind).clamp(0, max);
        let cache_end = read_pos.saturating_add(ahead).clamp(0, max);

        let seek_pos_at_read = table.bracket(params.ms_to_stream_pts(read_pos.clamp(0, max)));
        let seek_pos_at_begin = table.bracket(params.ms_to_stream_pts(cache_begin)).0;
        let seek_pos_at_end = table.bracket(params.ms_to_stream_pts(cache_end)).1;

        Self {
            read_pos,
            cache_begin,
            cache_end,
            seek_pos_at_read,
            seek_pos_at_begin,
            seek_pos_at_end,
        }
    }

    /// Recompute for a new read head.
    ///
    /// The millisecond fields always follow `read_pos`; the return value is
    /// true only when the seek bounds moved (or `force` is set), i.e. when
    /// the task list needs rebuilding.
    pub fn update(
        &mut self,
        read_pos: i64,
        params: &WindowParams,
        table: &SeekPointTable,
        force: bool,
    ) -> bool {
        let next = Self::compute(read_pos, params, table);
        let changed = force
            || next.seek_pos_at_begin != self.seek_pos_at_begin
            || next.seek_pos_at_end != self.seek_pos_at_end;
        *self = next;
        changed
    }

    #[inline]
    pub fn contains(&self, ms: i64) -> bool {
        ms >= self.cache_begin && ms <= self.cache_end
    }

    /// Whether a stream timestamp lies between the bracketing seek points
    #[inline]
    pub fn covers_pts(&self, pts: i64) -> bool {
        pts >= self.seek_pos_at_begin && pts < self.seek_pos_at_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(direction: Direction) -> WindowParams {
        WindowParams {
            time_base: Rational::MILLIS,
            start_pts: 0,
            duration_ms: 10_000,
            direction,
            forward_ms: 1500,
            backward_ms: 500,
        }
    }

    fn gops_of_one_second() -> SeekPointTable {
        SeekPointTable::uniform(0, 1000, 10_000)
    }

    #[test]
    fn test_forward_window() {
        let w = CacheWindow::compute(2000, &params(Direction::Forward), &gops_of_one_second());
        assert_eq!(w.cache_begin, 1500);
        assert_eq!(w.cache_end, 3500);
        assert_eq!(w.seek_pos_at_begin, 1000);
        assert_eq!(w.seek_pos_at_end, 4000);
        assert_eq!(w.seek_pos_at_read, (2000, 3000));
    }

    #[test]
    fn test_covers_pts_spans_whole_gops() {
        let w = CacheWindow::compute(2000, &params(Direction::Forward), &gops_of_one_second());
        assert!(w.covers_pts(1000));
        assert!(w.covers_pts(3999));
        assert!(!w.covers_pts(999));
        assert!(!w.covers_pts(4000));
    }

    #[test]
    fn test_backward_window_swaps_sides() {
        let w = CacheWindow::compute(2000, &params(Direction::Backward), &gops_of_one_second());
        assert_eq!(w.cache_begin, 500);
        assert_eq!(w.cache_end, 2500);
    }

    #[test]
    fn test_window_clamped_to_duration() {
        let table = gops_of_one_second();
        let w = CacheWindow::compute(9800, &params(Direction::Forward), &table);
        assert_eq!(w.cache_end, 10_000);
        assert_eq!(w.seek_pos_at_end, i64::MAX);

        let w = CacheWindow::compute(100, &params(Direction::Forward), &table);
        assert_eq!(w.cache_begin, 0);
        assert_eq!(w.seek_pos_at_begin, 0);
    }

    #[test]
    fn test_update_reports_bound_changes_only() {
        let table = gops_of_one_second();
        let p = params(Direction::Forward);
        let mut w = CacheWindow::compute(2000, &p, &table);

        // same GOPs, ms fields still move
        assert!(!w.update(2100, &p, &table, false));
        assert_eq!(w.read_pos, 2100);
        assert_eq!(w.cache_end, 3600);

        assert!(w.update(2100, &p, &table, true));
        assert!(w.update(3000, &p, &table, false));
        assert!(w.contains(w.read_pos));
    }
}
