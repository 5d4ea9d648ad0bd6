//! Elastic worker pool
//!
//! Runs jobs on a set of workers that grows on demand up to `max_workers`
//! and shrinks back toward `min_workers` when workers sit idle. When every
//! worker is busy a submission waits, bounded by `job_receive_timeout`,
//! instead of queueing without limit.
//!
//! Idle retirement and receive timeouts are both armed through the
//! [`deadline`](crate::deadline) scheduler rather than per-worker timers.

mod worker;

use crate::config::PoolConfig;
use crate::deadline::{DeadlineError, Requester, Waiter};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info};

/// Boxed, sendable future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Worker pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already serving")]
    AlreadyServing,

    #[error("Pool is already closed")]
    AlreadyClosed,

    #[error("Pool is closed")]
    Closed,

    #[error("No worker became available in time")]
    ReceiveTimeout,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Job dropped before reporting a result")]
    JobLost,

    #[error("Deadline error: {0}")]
    Deadline(#[from] DeadlineError),
}

/// A unit of work for the pool
pub struct Job {
    work: BoxFuture<'static, crate::Result<()>>,
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl Job {
    pub fn new<F>(work: F) -> Self
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        Self {
            work: Box::pin(work),
            cleanup: None,
        }
    }

    /// Attach a future that runs if the pool refuses the job
    pub fn with_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cleanup = Some(Box::pin(cleanup));
        self
    }
}

/// Pool builder. Serves one session at a time.
pub struct Pool {
    config: PoolConfig,
    requester: Requester,
    active: Arc<AtomicBool>,
}

impl Pool {
    pub fn new(config: PoolConfig, requester: Requester) -> Self {
        Self {
            config,
            requester,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start accepting jobs and warm `min_workers` workers.
    ///
    /// Fails with [`PoolError::AlreadyServing`] until the handle of the
    /// previous session has been closed.
    pub fn serve(&self) -> Result<PoolHandle, PoolError> {
        if self.config.max_workers == 0 {
            return Err(PoolError::InvalidConfig("max_workers must be at least 1".into()));
        }
        if self.config.min_workers > self.config.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.config.min_workers, self.config.max_workers
            )));
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::AlreadyServing);
        }

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            requester: self.requester.clone(),
            active: self.active.clone(),
            state: Mutex::new(State::default()),
            freed: Notify::new(),
            drained: Notify::new(),
        });

        {
            let mut state = shared.lock();
            for _ in 0..self.config.min_workers {
                shared.spawn_worker(&mut state, None);
            }
        }

        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Worker pool serving"
        );

        Ok(PoolHandle { shared })
    }
}

/// Handle to a serving pool
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Hand `job` to a worker and return without waiting for it.
    ///
    /// Waits at most `job_receive_timeout` for a worker when all of them
    /// are busy. A refused job has its cleanup run before the error is
    /// returned.
    pub async fn run(&self, job: Job) -> Result<(), PoolError> {
        let mut job = job;
        let mut deadline: Option<Waiter> = None;

        loop {
            let freed = self.shared.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            job = match self.shared.try_assign(job) {
                Assign::Accepted => return Ok(()),
                Assign::Closed(job) => return Err(reject(job, PoolError::Closed).await),
                Assign::Saturated(job) => job,
            };

            let waiter = match deadline.take() {
                Some(waiter) => waiter,
                None => {
                    let timeout = self.shared.config.job_receive_timeout();
                    match self.shared.requester.request_after(timeout) {
                        Ok(waiter) => waiter,
                        Err(e) => return Err(reject(job, e.into()).await),
                    }
                }
            };
            let waiter = deadline.insert(waiter);

            tokio::select! {
                _ = &mut freed => {}
                fired = waiter.wait() => {
                    let err = match fired {
                        Ok(()) => PoolError::ReceiveTimeout,
                        Err(e) => e.into(),
                    };
                    return Err(reject(job, err).await);
                }
            }
        }
    }

    /// Run `job` and wait for its result
    pub async fn run_wait(&self, job: Job) -> crate::Result<()> {
        let (tx, rx) = oneshot::channel();
        let Job { work, cleanup } = job;

        let job = Job {
            work: Box::pin(async move {
                let _ = tx.send(work.await);
                Ok(())
            }),
            cleanup,
        };

        self.run(job).await?;
        rx.await.map_err(|_| PoolError::JobLost)?
    }

    /// Stop intake, wake blocked submitters and wait for every worker to
    /// exit. Jobs already handed out run to completion.
    pub async fn close(&self) -> Result<(), PoolError> {
        let released = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::AlreadyClosed);
            }
            state.closed = true;

            let idle = std::mem::take(&mut state.idle);
            idle.into_iter()
                .filter_map(|id| state.workers.remove(&id))
                .collect::<Vec<_>>()
        };

        debug!(idle = released.len(), "Closing worker pool");

        // Idle workers exit once their intake closes
        drop(released);
        self.shared.freed.notify_waiters();

        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.shared.lock().alive == 0 {
                break;
            }
            drained.await;
        }

        self.shared.active.store(false, Ordering::Release);
        info!("Worker pool closed");
        Ok(())
    }

    /// Registered workers, busy or idle
    pub fn workers(&self) -> usize {
        self.shared.lock().workers.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

async fn reject(job: Job, err: PoolError) -> PoolError {
    debug!("Job refused: {}", err);
    if let Some(cleanup) = job.cleanup {
        cleanup.await;
    }
    err
}

enum Assign {
    Accepted,
    Saturated(Job),
    Closed(Job),
}

/// Outcome of a worker finishing a job
enum Release {
    Idle { above_floor: bool },
    Stop,
}

struct Slot {
    busy: bool,
    jobs: mpsc::Sender<Job>,
}

#[derive(Default)]
struct State {
    closed: bool,
    next_id: u64,
    workers: HashMap<u64, Slot>,
    idle: Vec<u64>,
    /// Worker tasks not yet exited, including ones already deregistered
    alive: usize,
}

struct Shared {
    config: PoolConfig,
    requester: Requester,
    active: Arc<AtomicBool>,
    state: Mutex<State>,
    freed: Notify,
    drained: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut State, first: Option<Job>) {
        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::channel(1);
        let busy = first.is_some();
        state.workers.insert(id, Slot { busy, jobs: tx });
        if !busy {
            state.idle.push(id);
        }
        state.alive += 1;

        let exit = worker::ExitGuard::new(self.clone(), id);
        tokio::spawn(worker::run(exit, rx, first));
    }

    /// Prefer an idle worker, else grow, else report saturation
    fn try_assign(self: &Arc<Self>, job: Job) -> Assign {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Assign::Closed(job);
        }

        let mut job = job;
        while let Some(id) = state.idle.pop() {
            let Some(slot) = state.workers.get_mut(&id) else {
                continue;
            };
            match slot.jobs.try_send(job) {
                Ok(()) => {
                    slot.busy = true;
                    return Assign::Accepted;
                }
                Err(e) => job = e.into_inner(),
            }
        }

        if state.workers.len() < self.config.max_workers {
            self.spawn_worker(state, Some(job));
            return Assign::Accepted;
        }

        Assign::Saturated(job)
    }

    fn release(&self, id: u64) -> Release {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            state.workers.remove(&id);
            return Release::Stop;
        }

        let above_floor = state.workers.len() > self.config.min_workers;
        match state.workers.get_mut(&id) {
            Some(slot) => {
                slot.busy = false;
                state.idle.push(id);
            }
            None => return Release::Stop,
        }
        drop(guard);

        self.freed.notify_one();
        Release::Idle { above_floor }
    }

    /// Idle deadline fired. Returns whether the worker may retire.
    fn propose_retire(&self, id: u64) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(slot) = state.workers.get(&id) else {
            return true;
        };
        if slot.busy || state.workers.len() <= self.config.min_workers {
            return false;
        }

        state.workers.remove(&id);
        state.idle.retain(|idle| *idle != id);
        true
    }

    fn exited(&self, id: u64) {
        {
            let mut state = self.lock();
            state.workers.remove(&id);
            state.idle.retain(|idle| *idle != id);
            state.alive -= 1;
        }
        self.freed.notify_one();
        self.drained.notify_waiters();
    }
}
