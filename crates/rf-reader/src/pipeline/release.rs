//! Auto-release thread for still images
//!
//! An image decodes to exactly one frame. Once that frame is converted the
//! demuxer, decoder and converter are dead weight, so this thread stops and
//! joins them while the converted frame stays readable in its task.

use std::sync::Arc;
use std::thread::JoinHandle;

use super::{PipelineShared, join_workers};

pub(crate) fn run_auto_release<D, C: Clone>(
    shared: Arc<PipelineShared<D, C>>,
    workers: Vec<JoinHandle<()>>,
) {
    while !shared.quit_requested() {
        let seen = shared.progress.generation();
        let converted = shared
            .scheduler
            .tasks_by_time()
            .iter()
            .any(|t| t.is_ready() && !t.converted_frames().is_empty());
        if converted || shared.is_fatal() {
            log::info!("image frame ready, releasing codec threads");
            break;
        }
        shared.progress.wait_since(seen, shared.idle * 10);
    }

    shared.release_workers();
    join_workers(workers);
    log::debug!("auto-release thread exit");
}
