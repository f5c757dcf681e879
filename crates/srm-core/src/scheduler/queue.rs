// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue backed scheduler.
//!
//! New jobs wait in a bounded FIFO queue (TQUEUED). Jobs coming back from a
//! backend call, a retry delay or a restart wait in a priority queue
//! (PRIORITYTQUEUED) that is always served first. A semaphore bounds how many
//! jobs run at once; `max_in_progress` bounds how many jobs may be between
//! their first run and a final or READY state. Jobs that finish `run` still
//! RUNNING are put on the ready queue (RQUEUED) and become READY while fewer
//! than `max_ready_jobs` jobs are READY or TRANSFERRING.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::job::{self, Job, JobId, State};

use super::{Scheduler, StateChangeListener};

/// Limits of a [`JobScheduler`].
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Maximum number of jobs waiting in the TQUEUED queue.
    pub max_requests: usize,
    /// Maximum number of jobs between their first run and READY.
    pub max_in_progress: usize,
    /// Maximum number of READY or TRANSFERRING jobs.
    pub max_ready_jobs: usize,
    /// Number of jobs running at once.
    pub thread_pool_size: usize,
    /// Delay before a job in RETRYWAIT is scheduled again.
    pub retry_timeout: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests: 10_000,
            max_in_progress: 1_000,
            max_ready_jobs: 1_000,
            thread_pool_size: 10,
            retry_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for JobSchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_requests: config.max_requests,
            max_in_progress: config.max_in_progress,
            max_ready_jobs: config.max_ready_jobs,
            thread_pool_size: config.thread_pool_size,
            retry_timeout: config.retry_timeout,
        }
    }
}

#[derive(Default)]
struct Queues {
    queued: VecDeque<Job>,
    priority: VecDeque<Job>,
    ready: VecDeque<Job>,
}

/// Scheduler with a bounded queue, a worker pool and a ready queue.
pub struct JobScheduler {
    id: String,
    timestamp: i64,
    config: JobSchedulerConfig,
    ctx: SrmContext,
    this: Weak<JobScheduler>,
    queues: Mutex<Queues>,
    counts: Mutex<HashMap<State, usize>>,
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
    workers: Arc<Semaphore>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobScheduler {
    pub fn new(id: impl Into<String>, config: JobSchedulerConfig, ctx: SrmContext) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.thread_pool_size.max(1)));
        Arc::new_cyclic(|this| Self {
            id: id.into(),
            timestamp: Utc::now().timestamp_millis(),
            config,
            ctx,
            this: this.clone(),
            queues: Mutex::new(Queues::default()),
            counts: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            workers,
            stopped: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &JobSchedulerConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Number of owned jobs currently in `state`, as seen through state
    /// change notifications.
    pub fn count(&self, state: State) -> usize {
        locked(&self.counts).get(&state).copied().unwrap_or(0)
    }

    pub fn queued_len(&self) -> usize {
        locked(&self.queues).queued.len()
    }

    pub fn priority_queued_len(&self) -> usize {
        locked(&self.queues).priority.len()
    }

    pub fn ready_queued_len(&self) -> usize {
        locked(&self.queues).ready.len()
    }

    fn in_progress(&self) -> usize {
        let counts = locked(&self.counts);
        [
            State::Running,
            State::AsyncWait,
            State::RetryWait,
            State::PriorityTQueued,
            State::RunningWithoutThread,
        ]
        .iter()
        .map(|state| counts.get(state).copied().unwrap_or(0))
        .sum()
    }

    fn ready_in_use(&self) -> usize {
        self.count(State::Ready) + self.count(State::Transferring)
    }

    /// Stop dispatching. Queued jobs stay in their states and are recovered
    /// on the next start; pending retry timers are dropped.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(scheduler_id = %self.id, "Scheduler stopping");
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Start as many queued jobs as the worker pool and the in-progress
    /// limit allow.
    fn dispatch(&self) {
        if self.is_stopped() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        loop {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                return;
            };
            let next = {
                let mut queues = locked(&self.queues);
                match queues.priority.pop_front() {
                    Some(job) => Some(job),
                    None if self.in_progress() < self.config.max_in_progress => {
                        queues.queued.pop_front()
                    }
                    None => None,
                }
            };
            let Some(job) = next else {
                return;
            };
            let this = this.clone();
            tokio::spawn(async move {
                this.execute(job).await;
                drop(permit);
                this.dispatch();
            });
        }
    }

    /// Run one job on a worker.
    async fn execute(&self, job: Job) {
        let job_id = job.id();
        let still_running = {
            let mut guard = job.lock().await;
            let state = guard.data().state();
            if !matches!(state, State::TQueued | State::PriorityTQueued) {
                debug!(job_id = %job_id, state = %state, "Dequeued job is no longer runnable");
                return;
            }
            if guard.data().scheduler_id() != Some(self.id.as_str()) {
                debug!(job_id = %job_id, "Dequeued job is owned by another scheduler");
                return;
            }
            if let Err(e) =
                job::set_state(&self.ctx, guard.body(), State::Running, "Processing request", false)
                    .await
            {
                error!(job_id = %job_id, error = %e, "Failed to start job");
                return;
            }

            match guard.body().run(&self.ctx).await {
                Ok(()) => {}
                Err(JobFailure::NonFatal { message }) => {
                    let data = guard.data();
                    if data.retries() >= data.max_retries() {
                        warn!(job_id = %job_id, error = %message, "Retries exhausted");
                        let description =
                            format!("Maximum number of retries exceeded: {}", message);
                        if let Err(e) = job::set_state(
                            &self.ctx,
                            guard.body(),
                            State::Failed,
                            &description,
                            true,
                        )
                        .await
                        {
                            error!(job_id = %job_id, error = %e, "Failed to fail job");
                        }
                    } else {
                        debug!(job_id = %job_id, error = %message, "Job will be retried");
                        match job::set_state(
                            &self.ctx,
                            guard.body(),
                            State::RetryWait,
                            &message,
                            true,
                        )
                        .await
                        {
                            Ok(()) => self.start_retry_timer(job.clone()),
                            Err(e) => {
                                error!(job_id = %job_id, error = %e, "Failed to enter RETRYWAIT")
                            }
                        }
                    }
                }
                Err(JobFailure::Fatal { message, status }) => {
                    warn!(job_id = %job_id, error = %message, status = %status, "Job failed");
                    if let Err(e) = job::set_state_and_status(
                        &self.ctx,
                        guard.body(),
                        State::Failed,
                        &message,
                        status,
                    )
                    .await
                    {
                        error!(job_id = %job_id, error = %e, "Failed to fail job");
                    }
                }
            }

            if guard.data().state() == State::Running {
                match job::set_state(
                    &self.ctx,
                    guard.body(),
                    State::RQueued,
                    "Putting on a \"Ready\" Queue.",
                    false,
                )
                .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to enter RQUEUED");
                        false
                    }
                }
            } else {
                false
            }
        };

        if still_running && let Err(e) = self.try_to_ready_job(job).await {
            warn!(job_id = %job_id, error = %e, "Failed to make job ready");
        }
    }

    fn start_retry_timer(&self, job: Job) {
        let ctx = self.ctx.clone();
        let delay = self.config.retry_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = async {
                    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
                } => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = job.reschedule(&ctx).await {
                        warn!(job_id = %job.id(), error = %e, "Failed to reschedule job after retry delay");
                    }
                }
            }
        });
    }

    /// A READY or TRANSFERRING slot was freed; offer it to the next job on
    /// the ready queue.
    fn ready_slot_freed(&self) {
        let next = locked(&self.queues).ready.pop_front();
        let (Some(job), Some(this)) = (next, self.this.upgrade()) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.try_to_ready_job(job.clone()).await {
                warn!(job_id = %job.id(), error = %e, "Failed to make job ready");
            }
        });
    }

    fn reject(&self, job_id: JobId, reason: impl Into<String>) -> SrmError {
        SrmError::SchedulingRejected {
            job_id,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Scheduler for JobScheduler {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    async fn schedule(&self, job: Job) -> Result<(), SrmError> {
        let job_id = job.id();
        if self.is_stopped() {
            return Err(self.reject(job_id, "scheduler is stopped"));
        }
        {
            let mut guard = job.lock().await;
            if guard.data().scheduler_id() != Some(self.id.as_str()) {
                return Err(self.reject(job_id, "job is not owned by this scheduler"));
            }
            match guard.data().state() {
                State::Pending => {
                    if self.queued_len() >= self.config.max_requests {
                        warn!(job_id = %job_id, "Queue full, rejecting job");
                        job::set_state(
                            &self.ctx,
                            guard.body(),
                            State::Failed,
                            "Site busy: Too many queued requests.",
                            true,
                        )
                        .await?;
                        return Err(self.reject(job_id, "too many queued requests"));
                    }
                    job::set_state(
                        &self.ctx,
                        guard.body(),
                        State::TQueued,
                        "Request enqueued.",
                        false,
                    )
                    .await?;
                    locked(&self.queues).queued.push_back(job.clone());
                }
                State::RetryWait
                | State::Restored
                | State::AsyncWait
                | State::RunningWithoutThread => {
                    job::set_state(
                        &self.ctx,
                        guard.body(),
                        State::PriorityTQueued,
                        "Waiting for thread.",
                        false,
                    )
                    .await?;
                    locked(&self.queues).priority.push_back(job.clone());
                }
                other => {
                    return Err(self.reject(job_id, format!("cannot schedule a job in {}", other)));
                }
            }
        }
        self.dispatch();
        Ok(())
    }

    fn state_changed(&self, job_id: JobId, old: State, new: State) {
        {
            let mut counts = locked(&self.counts);
            if let Some(count) = counts.get_mut(&old) {
                *count = count.saturating_sub(1);
            }
            if !new.is_final() {
                *counts.entry(new).or_insert(0) += 1;
            }
        }

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener.state_changed(job_id, old, new);
        }

        let held_slot = matches!(old, State::Ready | State::Transferring);
        let holds_slot = matches!(new, State::Ready | State::Transferring);
        if held_slot && !holds_slot {
            self.ready_slot_freed();
        }
        if new.is_final() || holds_slot {
            self.dispatch();
        }
    }

    async fn try_to_ready_job(&self, job: Job) -> Result<(), SrmError> {
        let job_id = job.id();
        let mut guard = job.lock().await;
        if guard.data().state() != State::RQueued {
            return Ok(());
        }
        if self.ready_in_use() >= self.config.max_ready_jobs {
            debug!(job_id = %job_id, "No ready slot, job stays on the ready queue");
            let mut queues = locked(&self.queues);
            if !queues.ready.iter().any(|queued| queued.id() == job_id) {
                queues.ready.push_back(job.clone());
            }
            return Ok(());
        }
        job::set_state(&self.ctx, guard.body(), State::Ready, "Execution succeeded.", true).await
    }

    fn info(&self) -> String {
        let queues = locked(&self.queues);
        format!(
            "Scheduler id={} queued={} priority={} ready_queue={} running={} async_wait={} \
             retry_wait={} ready={} transferring={} workers_free={}/{}",
            self.id,
            queues.queued.len(),
            queues.priority.len(),
            queues.ready.len(),
            self.count(State::Running),
            self.count(State::AsyncWait),
            self.count(State::RetryWait),
            self.count(State::Ready),
            self.count(State::Transferring),
            self.workers.available_permits(),
            self.config.thread_pool_size,
        )
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
