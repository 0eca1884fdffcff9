//! Pipeline threads
//!
//! Every started reader runs three worker threads over one scheduler:
//!
//! ```text
//!   demux ──packets──▶ GopTask ──▶ decode ──frames──▶ GopTask ──▶ convert
//!     ▲                                                              │
//!     └──── read position / pending seek ◀── reader API ◀── progress ┘
//! ```
//!
//! Image sources get a fourth, auto-release thread that stops the workers
//! once the single picture is converted. Threads wake each other through
//! bounded kick channels and fall back to polling every `idle_wait_ms`.

mod convert;
mod decode;
mod demux;
mod release;

pub(crate) use convert::{VideoOutputSlot, run_audio_convert, run_video_convert};
pub(crate) use decode::{DecodeOptions, run_decode};
pub(crate) use demux::run_demux;
pub(crate) use release::run_auto_release;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use rf_core::{RfError, RfResult};

use crate::scheduler::TaskScheduler;

// ============ Wakeups ============

/// Coalescing wakeup for one worker thread
pub(crate) struct Kick {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Kick {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn kick(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn wait(&self, timeout: Duration) {
        let _ = self.rx.recv_timeout(timeout);
    }
}

/// Broadcast "something was converted" to blocked readers
#[derive(Default)]
pub(crate) struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait until the generation moves past `seen` or `timeout` elapses
    pub fn wait_since(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.cond.wait_for(&mut generation, timeout);
        }
    }
}

/// Last error of a reader, readable after the failing thread is gone
#[derive(Debug, Default)]
pub struct ErrorSlot {
    message: Mutex<Option<String>>,
}

impl ErrorSlot {
    pub fn set(&self, message: impl Into<String>) {
        *self.message.lock() = Some(message.into());
    }

    pub fn get(&self) -> Option<String> {
        self.message.lock().clone()
    }

    pub fn clear(&self) {
        *self.message.lock() = None;
    }
}

// ============ Shared State ============

pub(crate) struct PipelineShared<D, C> {
    pub scheduler: TaskScheduler<D, C>,
    pub stream_index: usize,
    pub idle: Duration,
    pub demux_kick: Kick,
    pub decode_kick: Kick,
    pub convert_kick: Kick,
    pub progress: Signal,
    pub errors: Arc<ErrorSlot>,
    quit: AtomicBool,
    released: AtomicBool,
    fatal: AtomicBool,
}

impl<D, C> PipelineShared<D, C> {
    pub fn new(
        scheduler: TaskScheduler<D, C>,
        stream_index: usize,
        idle: Duration,
        errors: Arc<ErrorSlot>,
    ) -> Self {
        Self {
            scheduler,
            stream_index,
            idle,
            demux_kick: Kick::new(),
            decode_kick: Kick::new(),
            convert_kick: Kick::new(),
            progress: Signal::default(),
            errors,
            quit: AtomicBool::new(false),
            released: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    /// Worker threads exit when this turns true
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.quit.load(Ordering::Acquire) || self.released.load(Ordering::Acquire)
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.wake_all();
    }

    /// Stop the workers but keep converted frames readable
    pub fn release_workers(&self) {
        self.released.store(true, Ordering::Release);
        self.wake_all();
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// An unrecoverable error ended `stage`; readers degrade to what is cached
    pub fn record_fatal(&self, stage: &str, message: impl std::fmt::Display) {
        let message = format!("{} thread: {}", stage, message);
        log::error!("{}", message);
        self.errors.set(message);
        self.fatal.store(true, Ordering::Release);
        self.progress.notify();
    }

    pub fn wake_all(&self) {
        self.demux_kick.kick();
        self.decode_kick.kick();
        self.convert_kick.kick();
        self.progress.notify();
    }
}

// ============ Thread Handles ============

pub(crate) fn spawn_worker<F>(name: String, f: F) -> RfResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.clone()).spawn(f).map_err(|e| {
        log::error!("Failed to spawn {} thread: {}", name, e);
        RfError::Thread(e.to_string())
    })
}

pub(crate) fn join_workers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            log::error!("{} thread panicked", name);
        }
    }
}

/// Running worker threads of one reader
pub(crate) struct Pipeline<D, C: Clone> {
    pub shared: Arc<PipelineShared<D, C>>,
    handles: Vec<JoinHandle<()>>,
}

impl<D, C: Clone> Pipeline<D, C> {
    pub fn new(shared: Arc<PipelineShared<D, C>>, handles: Vec<JoinHandle<()>>) -> Self {
        Self { shared, handles }
    }

    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.request_quit();
        join_workers(std::mem::take(&mut self.handles));
        self.shared.scheduler.cancel_all();
    }
}

impl<D, C: Clone> Drop for Pipeline<D, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_kick_coalesces() {
        let kick = Kick::new();
        kick.kick();
        kick.kick();
        let start = Instant::now();
        kick.wait(Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(500));
        // second kick was dropped, so this one times out
        let start = Instant::now();
        kick.wait(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_signal_does_not_miss_notify() {
        let signal = Signal::default();
        let seen = signal.generation();
        signal.notify();
        let start = Instant::now();
        signal.wait_since(seen, Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
