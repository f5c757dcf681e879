// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for srm-core.
//!
//! Jobs are persisted as a [`JobRecord`]: the columns common to every job,
//! a JSON payload with the kind-specific fields, and the job's history.
//! Persistence is best-effort relative to the live state machine: callers
//! log failures instead of failing the transition that triggered the save.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::credential::RequestCredential;
use crate::error::SrmError;
use crate::job::{HistoryEvent, JobId, JobKind, State};
use crate::status::StatusCode;

/// Snapshot of a job as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Job identifier.
    pub id: JobId,
    /// Concrete job kind.
    pub kind: JobKind,
    /// Owning container request, for file requests.
    pub parent_id: Option<JobId>,
    /// State at the time of the save.
    pub state: State,
    /// When the job was created.
    pub creation_time: DateTime<Utc>,
    /// Lifetime relative to `creation_time`.
    pub lifetime_millis: i64,
    /// Scheduler that owns the job, if any.
    pub scheduler_id: Option<String>,
    /// Start timestamp of the owning scheduler.
    pub scheduler_timestamp: i64,
    pub priority: u32,
    pub retries: u32,
    pub max_retries: u32,
    pub last_state_transition_time: DateTime<Utc>,
    /// Terminal status code override.
    pub status_code: Option<StatusCode>,
    /// Cumulative state change descriptions.
    pub error_message: String,
    /// Kind-specific fields.
    pub payload: serde_json::Value,
    /// Append-only history.
    pub history: Vec<HistoryEvent>,
}

/// Persistence interface used by jobs, handlers and restart recovery.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Save a job.
    ///
    /// `force` is set for final states and for saves that must not be skipped
    /// (scheduler assignment). Implementations may skip non-forced saves.
    async fn save_job(&self, record: &JobRecord, force: bool) -> Result<(), SrmError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, SrmError>;

    /// Jobs of `kind` that are not in a final state.
    async fn get_active_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, SrmError>;

    /// File requests of a container, in creation order.
    async fn get_jobs_by_parent(&self, parent_id: JobId) -> Result<Vec<JobRecord>, SrmError>;

    /// Ids of the most recently finished jobs of `kind`, newest first.
    async fn get_latest_completed_job_ids(
        &self,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobId>, SrmError>;

    // ========================================================================
    // Delegated credentials
    // ========================================================================

    async fn save_credential(&self, credential: &RequestCredential) -> Result<(), SrmError>;

    async fn get_credential(&self, id: &str) -> Result<Option<RequestCredential>, SrmError>;

    /// Quick connectivity check.
    async fn health_check(&self) -> Result<bool, SrmError> {
        Ok(true)
    }
}
