// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence, for tests and embedded use without a database.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::credential::RequestCredential;
use crate::error::SrmError;
use crate::job::{JobId, JobKind};

use super::{JobRecord, Persistence};

/// Persistence backed by concurrent maps. Every save is kept, forced or not.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    jobs: DashMap<JobId, (u64, JobRecord)>,
    credentials: DashMap<String, RequestCredential>,
    sequence: AtomicU64,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `save_job` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn record(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.get(&id).map(|entry| entry.1.clone())
    }

    fn check(&self, operation: &str) -> Result<(), SrmError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SrmError::DatabaseError {
                operation: operation.to_string(),
                details: "persistence unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_job(&self, record: &JobRecord, _force: bool) -> Result<(), SrmError> {
        self.check("save_job")?;
        let sequence = self
            .jobs
            .get(&record.id)
            .map(|entry| entry.0)
            .unwrap_or_else(|| self.sequence.fetch_add(1, Ordering::SeqCst));
        self.jobs.insert(record.id, (sequence, record.clone()));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, SrmError> {
        self.check("get_job")?;
        Ok(self.record(id))
    }

    async fn get_active_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, SrmError> {
        self.check("get_active_jobs")?;
        let mut active: Vec<(u64, JobRecord)> = self
            .jobs
            .iter()
            .filter(|entry| entry.1.kind == kind && !entry.1.state.is_final())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|(sequence, _)| *sequence);
        Ok(active.into_iter().map(|(_, record)| record).collect())
    }

    async fn get_jobs_by_parent(&self, parent_id: JobId) -> Result<Vec<JobRecord>, SrmError> {
        self.check("get_jobs_by_parent")?;
        let mut children: Vec<(u64, JobRecord)> = self
            .jobs
            .iter()
            .filter(|entry| entry.1.parent_id == Some(parent_id))
            .map(|entry| entry.value().clone())
            .collect();
        children.sort_by_key(|(sequence, _)| *sequence);
        Ok(children.into_iter().map(|(_, record)| record).collect())
    }

    async fn get_latest_completed_job_ids(
        &self,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobId>, SrmError> {
        self.check("get_latest_completed_job_ids")?;
        let mut completed: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|entry| entry.1.kind == kind && entry.1.state.is_final())
            .map(|entry| entry.1.clone())
            .collect();
        completed.sort_by(|a, b| b.last_state_transition_time.cmp(&a.last_state_transition_time));
        Ok(completed
            .into_iter()
            .take(limit)
            .map(|record| record.id)
            .collect())
    }

    async fn save_credential(&self, credential: &RequestCredential) -> Result<(), SrmError> {
        self.check("save_credential")?;
        self.credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<RequestCredential>, SrmError> {
        self.check("get_credential")?;
        Ok(self.credentials.get(id).map(|entry| entry.clone()))
    }

    async fn health_check(&self) -> Result<bool, SrmError> {
        Ok(!self.failing.load(Ordering::SeqCst))
    }
}
