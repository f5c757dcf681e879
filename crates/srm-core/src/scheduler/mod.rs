// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler contract and the process-wide scheduler registry.
//!
//! Jobs carry the id of their owning scheduler as a string and resolve it
//! through the [`SchedulerRegistry`] whenever they need to be handed back
//! (after an asynchronous completion, a retry timer, or a restart).

pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::SrmError;
use crate::job::{Job, JobId, JobKind, State};

pub use queue::{JobScheduler, JobSchedulerConfig};

/// Accepts jobs and runs them when queue slots and workers are available.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Identifier stored in the jobs this scheduler owns.
    fn id(&self) -> &str;

    /// Start time of this scheduler instance, in milliseconds since the epoch.
    fn timestamp(&self) -> i64;

    /// Accept a job for execution. Must be called without the job's lock.
    async fn schedule(&self, job: Job) -> Result<(), SrmError>;

    /// Notification of a committed state change of an owned job.
    ///
    /// Called with the job's lock held; must not block or lock jobs.
    fn state_changed(&self, job_id: JobId, old: State, new: State);

    /// Move a job waiting in RQUEUED to READY if a ready slot is free.
    async fn try_to_ready_job(&self, job: Job) -> Result<(), SrmError>;

    /// Human readable status report.
    fn info(&self) -> String {
        format!("Scheduler id={}", self.id())
    }
}

/// Observer of every state change seen by a scheduler.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, job_id: JobId, old: State, new: State);
}

/// Live schedulers by id, and the scheduler assigned to each job kind.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: DashMap<String, Weak<dyn Scheduler>>,
    by_kind: DashMap<JobKind, String>,
    default_id: OnceLock<String>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scheduler. The first one registered becomes the default.
    ///
    /// The registry holds weak references; the owner keeps schedulers alive.
    pub fn register(&self, scheduler: &Arc<dyn Scheduler>) {
        let id = scheduler.id().to_string();
        let _ = self.default_id.set(id.clone());
        self.schedulers.insert(id, Arc::downgrade(scheduler));
    }

    pub fn unregister(&self, id: &str) {
        self.schedulers.remove(id);
    }

    /// Assign the scheduler that new jobs of `kind` are scheduled on.
    pub fn assign(&self, kind: JobKind, scheduler_id: &str) {
        self.by_kind.insert(kind, scheduler_id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(id).and_then(|entry| entry.upgrade())
    }

    /// The scheduler for `kind`, falling back to the default scheduler.
    pub fn for_kind(&self, kind: JobKind) -> Result<Arc<dyn Scheduler>, SrmError> {
        let id = self
            .by_kind
            .get(&kind)
            .map(|entry| entry.value().clone())
            .or_else(|| self.default_id.get().cloned())
            .ok_or_else(|| SrmError::SchedulerNotFound {
                scheduler_id: format!("<none for {}>", kind),
            })?;
        self.get(&id)
            .ok_or(SrmError::SchedulerNotFound { scheduler_id: id })
    }

    /// Kind assignments, for reports.
    pub fn assignments(&self) -> HashMap<JobKind, String> {
        self.by_kind
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Every live scheduler.
    pub fn schedulers(&self) -> Vec<Arc<dyn Scheduler>> {
        self.schedulers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedScheduler(&'static str);

    #[async_trait]
    impl Scheduler for NamedScheduler {
        fn id(&self) -> &str {
            self.0
        }

        fn timestamp(&self) -> i64 {
            0
        }

        async fn schedule(&self, _job: Job) -> Result<(), SrmError> {
            Ok(())
        }

        fn state_changed(&self, _job_id: JobId, _old: State, _new: State) {}

        async fn try_to_ready_job(&self, _job: Job) -> Result<(), SrmError> {
            Ok(())
        }
    }

    #[test]
    fn test_first_registered_scheduler_is_default() {
        let registry = SchedulerRegistry::new();
        let get: Arc<dyn Scheduler> = Arc::new(NamedScheduler("get"));
        let put: Arc<dyn Scheduler> = Arc::new(NamedScheduler("put"));
        registry.register(&get);
        registry.register(&put);
        registry.assign(JobKind::PutFile, "put");

        assert_eq!(registry.for_kind(JobKind::PutFile).unwrap().id(), "put");
        assert_eq!(registry.for_kind(JobKind::CopyFile).unwrap().id(), "get");
        assert_eq!(registry.schedulers().len(), 2);
    }

    #[test]
    fn test_dropped_scheduler_is_not_found() {
        let registry = SchedulerRegistry::new();
        {
            let scheduler: Arc<dyn Scheduler> = Arc::new(NamedScheduler("gone"));
            registry.register(&scheduler);
        }
        assert!(registry.get("gone").is_none());
        assert!(matches!(
            registry.for_kind(JobKind::GetFile),
            Err(SrmError::SchedulerNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_registry_has_no_scheduler() {
        let registry = SchedulerRegistry::new();
        assert!(registry.for_kind(JobKind::GetFile).is_err());
    }
}
