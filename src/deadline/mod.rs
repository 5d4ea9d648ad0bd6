//! Deadline scheduler
//!
//! Many channels and idle workers each need "wake me at T". Instead of one
//! timer per waiter, every request is parked in a single list and one
//! periodic scan fires the elapsed ones. Resolution is the scan interval.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Default scan interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

/// Default depth of the request intake queue
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("Deadline queue is full ({0} requests waiting for intake)")]
    QueueFull(usize),

    #[error("Scan interval must be non-zero")]
    InvalidInterval,

    #[error("Scheduler closed")]
    Closed,
}

/// One parked deadline
struct Pending {
    deadline: Instant,
    notify: oneshot::Sender<()>,
}

/// Scheduler builder. Consumed by [`Scheduler::serve`].
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    queue_depth: usize,
}

impl Scheduler {
    /// Create a scheduler scanning every `interval`, accepting at most
    /// `queue_depth` requests that have not yet been picked up by the scan task
    pub fn new(interval: Duration, queue_depth: usize) -> Self {
        Self {
            interval,
            queue_depth: queue_depth.max(1),
        }
    }

    /// Start the scan task. Must be called inside a tokio runtime.
    pub fn serve(self) -> Result<Requester, DeadlineError> {
        if self.interval.is_zero() {
            return Err(DeadlineError::InvalidInterval);
        }

        let (intake_tx, intake_rx) = mpsc::channel(self.queue_depth);
        let (down_tx, down_rx) = watch::channel(false);

        tokio::spawn(scan(self.interval, self.queue_depth, intake_rx, down_rx));

        debug!(
            interval_ms = self.interval.as_millis() as u64,
            queue_depth = self.queue_depth,
            "Deadline scheduler started"
        );

        Ok(Requester {
            intake: intake_tx,
            down: std::sync::Arc::new(down_tx),
            queue_depth: self.queue_depth,
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_QUEUE_DEPTH)
    }
}

/// Scan loop: fires elapsed deadlines on every tick, collects new requests
/// in between, and drops everything once the scheduler is closed.
async fn scan(
    interval: Duration,
    queue_depth: usize,
    mut intake: mpsc::Receiver<Pending>,
    mut down: watch::Receiver<bool>,
) {
    let mut pending: Vec<Pending> = Vec::new();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = down.changed() => {
                if changed.is_err() || *down.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                // Pick up at most one queue's worth queued since the last tick
                for _ in 0..queue_depth {
                    match intake.try_recv() {
                        Ok(request) => pending.push(request),
                        Err(_) => break,
                    }
                }
                fire_elapsed(&mut pending, Instant::now());
            }

            request = intake.recv() => match request {
                Some(request) => pending.push(request),
                None => break,
            },
        }
    }

    debug!(dropped = pending.len(), "Deadline scheduler stopped");
}

/// Fire every elapsed deadline and drop cancelled ones
fn fire_elapsed(pending: &mut Vec<Pending>, now: Instant) {
    let before = pending.len();

    let mut index = 0;
    while index < pending.len() {
        if pending[index].notify.is_closed() {
            pending.swap_remove(index);
        } else if pending[index].deadline <= now {
            let _ = pending.swap_remove(index).notify.send(());
        } else {
            index += 1;
        }
    }

    if before != pending.len() {
        trace!(
            released = before - pending.len(),
            remaining = pending.len(),
            "Deadline scan"
        );
    }
}

/// Cloneable handle for requesting deadlines
#[derive(Clone)]
pub struct Requester {
    intake: mpsc::Sender<Pending>,
    down: std::sync::Arc<watch::Sender<bool>>,
    queue_depth: usize,
}

impl Requester {
    /// Request a notification at `deadline`
    pub fn request(&self, deadline: Instant) -> Result<Waiter, DeadlineError> {
        if *self.down.borrow() {
            return Err(DeadlineError::Closed);
        }

        let (notify, fired) = oneshot::channel();

        self.intake
            .try_send(Pending { deadline, notify })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeadlineError::QueueFull(self.queue_depth),
                mpsc::error::TrySendError::Closed(_) => DeadlineError::Closed,
            })?;

        Ok(Waiter {
            deadline,
            fired: Some(fired),
            outcome: None,
        })
    }

    /// Request a notification `after` from now
    pub fn request_after(&self, after: Duration) -> Result<Waiter, DeadlineError> {
        self.request(Instant::now() + after)
    }

    /// Whether the scheduler has been closed
    pub fn is_closed(&self) -> bool {
        *self.down.borrow() || self.intake.is_closed()
    }

    /// Stop the scan task. Pending waiters observe [`DeadlineError::Closed`].
    pub fn close(&self) -> Result<(), DeadlineError> {
        if self.down.send_replace(true) {
            return Err(DeadlineError::Closed);
        }
        Ok(())
    }
}

/// A caller-owned deadline request. Dropping it cancels the request.
#[derive(Debug)]
pub struct Waiter {
    deadline: Instant,
    fired: Option<oneshot::Receiver<()>>,
    outcome: Option<bool>,
}

impl Waiter {
    /// The requested deadline
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until the scan reaches the deadline.
    ///
    /// Cancel safe. Once resolved, later calls return the same outcome
    /// immediately.
    pub async fn wait(&mut self) -> Result<(), DeadlineError> {
        if let Some(fired) = self.fired.as_mut() {
            let outcome = fired.await.is_ok();
            self.fired = None;
            self.outcome = Some(outcome);
        }

        match self.outcome {
            Some(true) => Ok(()),
            _ => Err(DeadlineError::Closed),
        }
    }

    /// Cancel the request
    pub fn close(self) {}
}
