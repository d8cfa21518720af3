//! Background peak building
//!
//! One worker thread, one queue. Requests for a peak that is already queued
//! or building are dropped; everyone interested sees the single completion
//! event.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tl_core::{TlError, TlResult};

use super::Peak;
use crate::ids::SourceId;

/// Build notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum PeakEvent {
    Progress { source: SourceId, channel: usize, percent: u32 },
    Finished { source: SourceId, channel: usize },
    Failed { source: SourceId, channel: usize, error: String },
}

enum PeakJob {
    Build(Arc<Peak>),
    Shutdown,
}

/// Handle for queueing builds; cheap to clone
#[derive(Clone)]
pub struct PeakQueue {
    jobs: Sender<PeakJob>,
    pending: Arc<Mutex<HashSet<(SourceId, usize)>>>,
}

impl PeakQueue {
    /// Returns false when the same peak is already queued or building
    pub fn enqueue(&self, peak: Arc<Peak>) -> bool {
        let key = peak.key();
        {
            let mut pending = self.pending.lock();
            if !pending.insert(key) {
                return false;
            }
        }
        log::debug!("[PeakScheduler] queued {} ch{}", key.0, key.1);
        if self.jobs.send(PeakJob::Build(peak)).is_err() {
            self.pending.lock().remove(&key);
            return false;
        }
        true
    }

    pub fn is_pending(&self, source: SourceId, channel: usize) -> bool {
        self.pending.lock().contains(&(source, channel))
    }
}

pub struct PeakScheduler {
    queue: PeakQueue,
    events: Receiver<PeakEvent>,
    worker: Option<JoinHandle<()>>,
}

impl PeakScheduler {
    pub fn new() -> TlResult<Self> {
        let (job_tx, job_rx) = unbounded::<PeakJob>();
        let (event_tx, event_rx) = unbounded();
        let pending: Arc<Mutex<HashSet<(SourceId, usize)>>> = Arc::new(Mutex::new(HashSet::new()));

        let worker_pending = pending.clone();
        let handle = std::thread::Builder::new()
            .name("peak-builder".into())
            .spawn(move || run_worker(job_rx, event_tx, worker_pending))
            .map_err(|e| {
                log::error!("[PeakScheduler] Failed to spawn worker thread: {}", e);
                TlError::Io(e)
            })?;

        Ok(Self {
            queue: PeakQueue {
                jobs: job_tx,
                pending,
            },
            events: event_rx,
            worker: Some(handle),
        })
    }

    pub fn queue(&self) -> PeakQueue {
        self.queue.clone()
    }

    pub fn poll_events(&self) -> Vec<PeakEvent> {
        self.events.try_iter().collect()
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<PeakEvent> {
        self.events.recv_timeout(timeout).ok()
    }
}

impl Drop for PeakScheduler {
    fn drop(&mut self) {
        let _ = self.queue.jobs.send(PeakJob::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("[PeakScheduler] worker panicked");
            }
        }
    }
}

fn run_worker(
    jobs: Receiver<PeakJob>,
    events: Sender<PeakEvent>,
    pending: Arc<Mutex<HashSet<(SourceId, usize)>>>,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            PeakJob::Build(peak) => {
                let done = peak.build(&events);
                // Cleared before the completion event goes out
                pending.lock().remove(&peak.key());
                if let Some(event) = done {
                    let _ = events.send(event);
                }
            }
            PeakJob::Shutdown => break,
        }
    }
    log::debug!("[PeakScheduler] worker stopped");
}
