//! Seek point table
//!
//! Sorted key-frame timestamps of one stream. Consecutive points delimit the
//! decode units (GOPs) the scheduler turns into tasks.

/// Sorted, de-duplicated seek points in stream time base units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeekPointTable {
    points: Vec<i64>,
}

impl SeekPointTable {
    pub fn new(mut points: Vec<i64>) -> Self {
        points.sort_unstable();
        points.dedup();
        Self { points }
    }

    /// Evenly spaced points `start, start + step, ...` below `end`.
    ///
    /// Used for audio streams, which have no key frames worth indexing.
    pub fn uniform(start: i64, step: i64, end: i64) -> Self {
        let mut points = vec![start];
        if step > 0 {
            let mut p = start + step;
            while p < end {
                points.push(p);
                p += step;
            }
        }
        Self { points }
    }

    pub fn points(&self) -> &[i64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<i64> {
        self.points.first().copied()
    }

    /// Seek points around `pts`: the greatest point <= `pts` (or the first
    /// point if `pts` precedes it) and the following point, `i64::MAX` when
    /// there is none.
    pub fn bracket(&self, pts: i64) -> (i64, i64) {
        if self.points.is_empty() {
            return (0, i64::MAX);
        }
        let idx = self.points.partition_point(|p| *p <= pts);
        let first = idx.saturating_sub(1);
        let second = self.points.get(first + 1).copied().unwrap_or(i64::MAX);
        (self.points[first], second)
    }

    /// Smallest point strictly greater than `pts`, `i64::MAX` when none
    pub fn next_after(&self, pts: i64) -> i64 {
        let idx = self.points.partition_point(|p| *p <= pts);
        self.points.get(idx).copied().unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket() {
        let table = SeekPointTable::new(vec![0, 100, 200]);
        assert_eq!(table.bracket(0), (0, 100));
        assert_eq!(table.bracket(150), (100, 200));
        assert_eq!(table.bracket(200), (200, i64::MAX));
        assert_eq!(table.bracket(5000), (200, i64::MAX));
        // before the first point
        assert_eq!(table.bracket(-10), (0, 100));
    }

    #[test]
    fn test_empty_table_is_one_range() {
        let table = SeekPointTable::default();
        assert_eq!(table.bracket(42), (0, i64::MAX));
        assert_eq!(table.next_after(42), i64::MAX);
    }

    #[test]
    fn test_uniform() {
        let table = SeekPointTable::uniform(0, 1000, 3500);
        assert_eq!(table.points(), &[0, 1000, 2000, 3000]);
        assert_eq!(table.next_after(1000), 2000);
        assert_eq!(table.next_after(3000), i64::MAX);
    }

    #[test]
    fn test_new_sorts_and_dedups() {
        let table = SeekPointTable::new(vec![300, 0, 300, 100]);
        assert_eq!(table.points(), &[0, 100, 300]);
    }
}
