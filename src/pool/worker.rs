//! Worker task loop

use super::{Job, Release, Shared};
use crate::deadline::Waiter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Deregisters the worker when its task ends, however it ends
pub(super) struct ExitGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl ExitGuard {
    pub(super) fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self { shared, id }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.exited(self.id);
        trace!(worker = self.id, "Worker exited");
    }
}

pub(super) async fn run(exit: ExitGuard, mut jobs: mpsc::Receiver<Job>, first: Option<Job>) {
    let shared = exit.shared.clone();
    let id = exit.id;
    let mut next = first;
    let mut idle_deadline: Option<Waiter> = None;

    loop {
        let job = match next.take() {
            Some(job) => job,
            None => match wait_for_job(&shared, id, &mut jobs, idle_deadline.take()).await {
                Some(job) => job,
                None => break,
            },
        };

        if let Err(e) = job.work.await {
            debug!(worker = id, "Job failed: {}", e);
        }

        match shared.release(id) {
            Release::Stop => break,
            Release::Idle { above_floor: false } => {}
            Release::Idle { above_floor: true } => {
                // Scheduler trouble only costs the chance to retire
                idle_deadline = shared
                    .requester
                    .request_after(shared.config.max_worker_idle())
                    .ok();
            }
        }
    }

    drop(exit);
}

/// Next job, or `None` once the worker should exit
async fn wait_for_job(
    shared: &Shared,
    id: u64,
    jobs: &mut mpsc::Receiver<Job>,
    mut idle_deadline: Option<Waiter>,
) -> Option<Job> {
    loop {
        let Some(waiter) = idle_deadline.as_mut() else {
            return jobs.recv().await;
        };

        tokio::select! {
            biased;
            job = jobs.recv() => return job,
            fired = waiter.wait() => {
                if fired.is_ok() && shared.propose_retire(id) {
                    trace!(worker = id, "Worker retiring");
                    return None;
                }
                idle_deadline = None;
            }
        }
    }
}
