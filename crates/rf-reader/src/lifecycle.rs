//! Pieces shared by the video and audio reader front-ends

use std::sync::atomic::{AtomicU8, Ordering};

use rf_core::{RfError, RfResult};

use crate::scheduler::TaskScheduler;

/// Why a blocked read has to give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum InterruptReason {
    None = 0,
    Suspend = 1,
    Stop = 2,
    Close = 3,
}

/// Lock-free flag raised before a lifecycle call takes the API lock, so a
/// read blocked inside the lock returns instead of deadlocking it.
#[derive(Debug, Default)]
pub(crate) struct Interrupt(AtomicU8);

impl Interrupt {
    pub fn raise(&self, reason: InterruptReason) {
        self.0.store(reason as u8, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(InterruptReason::None as u8, Ordering::Release);
    }

    pub fn check(&self) -> RfResult<()> {
        match self.0.load(Ordering::Acquire) {
            0 => Ok(()),
            1 => Err(RfError::NotReady("reader suspended".into())),
            2 => Err(RfError::NotReady("reader stopped".into())),
            _ => Err(RfError::Closed),
        }
    }
}

/// Snapshot of a reader's cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub read_pos_ms: i64,
    pub tasks: usize,
    /// Tasks fully decoded and converted
    pub ready_tasks: usize,
    /// Frames decoded but not converted yet
    pub pending_frames: i64,
    pub converted_frames: usize,
}

impl ReaderStats {
    pub(crate) fn collect<D, C: Clone>(scheduler: &TaskScheduler<D, C>) -> Self {
        let tasks = scheduler.tasks_by_time();
        Self {
            read_pos_ms: scheduler.read_pos(),
            tasks: tasks.len(),
            ready_tasks: tasks.iter().filter(|t| t.is_ready()).count(),
            pending_frames: scheduler.pending().get(),
            converted_frames: tasks.iter().map(|t| t.converted_count()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_reasons() {
        let flag = Interrupt::default();
        assert!(flag.check().is_ok());
        flag.raise(InterruptReason::Close);
        assert!(matches!(flag.check(), Err(RfError::Closed)));
        flag.raise(InterruptReason::Suspend);
        assert!(matches!(flag.check(), Err(RfError::NotReady(_))));
        flag.clear();
        assert!(flag.check().is_ok());
    }
}
