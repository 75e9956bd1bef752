//! Per-ring worker thread management
//!
//! Each completion ring is serviced by exactly one thread running one
//! [`RxProcessor`]. The worker polls with the configured quota, backs off
//! while the ring is idle and pauses while a self-recovery is in progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use super::process::{ProcessReport, RxProcessor};
use crate::error::RxError;
use crate::recovery::SelfRecovery;

const MIN_IDLE: Duration = Duration::from_micros(50);
const MAX_IDLE: Duration = Duration::from_millis(5);
const RECOVERY_POLL: Duration = Duration::from_millis(10);

/// Progress reported by a worker
#[derive(Debug)]
pub enum WorkerEvent {
    /// A service call reaped at least one entry
    Processed { ring_id: u8, report: ProcessReport },
    /// A service call failed
    Failed { ring_id: u8, error: String },
}

/// Handle to a running rx worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub ring_id: u8,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the worker servicing `processor`'s ring
pub fn spawn_rx_worker(
    mut processor: RxProcessor,
    quota: usize,
    recovery: Arc<dyn SelfRecovery>,
    events: Sender<WorkerEvent>,
) -> Result<WorkerHandle, String> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let ring_id = processor.ring_id();

    let thread = thread::Builder::new()
        .name(format!("rx-{ring_id}"))
        .spawn(move || {
            info!(ring_id, quota, "Rx worker started");
            run_worker(&mut processor, quota, recovery.as_ref(), &events, &shutdown_clone);
            info!(ring_id, "Rx worker stopped");
        })
        .map_err(|e| format!("Failed to spawn rx worker thread: {e}"))?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        ring_id,
    })
}

fn run_worker(
    processor: &mut RxProcessor,
    quota: usize,
    recovery: &dyn SelfRecovery,
    events: &Sender<WorkerEvent>,
    shutdown: &AtomicBool,
) {
    let ring_id = processor.ring_id();
    let mut idle = MIN_IDLE;

    while !shutdown.load(Ordering::SeqCst) {
        if recovery.is_recovering() {
            thread::sleep(RECOVERY_POLL);
            continue;
        }

        match processor.process(quota) {
            Ok(report) if report.reaped == 0 => {
                thread::sleep(idle);
                idle = (idle * 2).min(MAX_IDLE);
            }
            Ok(report) => {
                idle = MIN_IDLE;
                debug!(ring_id, ?report, "Rx service call");
                // Nobody listening is fine
                let _ = events.send(WorkerEvent::Processed { ring_id, report });
            }
            Err(e @ RxError::RingAccess { .. }) => {
                warn!(ring_id, error = %e, "Rx ring busy, retrying");
                thread::sleep(idle);
            }
            Err(e) => {
                error!(ring_id, error = %e, "Rx service call failed");
                let _ = events.send(WorkerEvent::Failed {
                    ring_id,
                    error: e.to_string(),
                });
            }
        }
    }
}
