// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared collaborators handed to every job operation.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::credential::{CredentialCache, RequestCredential};
use crate::error::SrmError;
use crate::job::{Job, JobId};
use crate::persistence::Persistence;
use crate::registry::{JobRegistry, UploadRegistry};
use crate::scheduler::SchedulerRegistry;
use crate::storage::StorageBackend;

/// Process-wide state. Cheap to clone.
#[derive(Clone)]
pub struct SrmContext {
    pub jobs: Arc<JobRegistry>,
    pub schedulers: Arc<SchedulerRegistry>,
    pub uploads: Arc<UploadRegistry>,
    pub persistence: Arc<dyn Persistence>,
    pub storage: Arc<dyn StorageBackend>,
    pub credentials: Arc<CredentialCache>,
    pub config: Arc<Config>,
}

impl SrmContext {
    pub fn new(
        config: Config,
        persistence: Arc<dyn Persistence>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let credentials = CredentialCache::new(
            config.credential_cache_size,
            config.credential_cache_ttl,
        );
        Self {
            jobs: Arc::new(JobRegistry::new()),
            schedulers: Arc::new(SchedulerRegistry::new()),
            uploads: Arc::new(UploadRegistry::new()),
            persistence,
            storage,
            credentials: Arc::new(credentials),
            config: Arc::new(config),
        }
    }

    /// Resolve a job by id: live registry first, persistence second.
    ///
    /// Jobs loaded from persistence are registered, so later lookups see the
    /// same instance. File requests are loaded through their container.
    pub async fn load_job(&self, id: JobId) -> Result<Job, SrmError> {
        if let Some(job) = self.jobs.get(&id) {
            return Ok(job);
        }
        let record = self
            .persistence
            .get_job(id)
            .await?
            .ok_or_else(|| SrmError::JobNotFound {
                job_id: id.to_string(),
            })?;

        if let Some(parent_id) = record.parent_id {
            Box::pin(self.load_job(parent_id)).await?;
            return self.jobs.get(&id).ok_or_else(|| SrmError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        let children = if record.kind.is_container() {
            self.persistence.get_jobs_by_parent(id).await?
        } else {
            Vec::new()
        };
        let job = Job::restore(&record, &children)?;
        debug!(job_id = %id, kind = %record.kind, "Loaded job from persistence");
        self.jobs.register(job.clone());
        Ok(job)
    }

    /// Resolve the delegated credential of a request, if any.
    pub async fn credential(
        &self,
        credential_id: Option<&str>,
    ) -> Result<Option<RequestCredential>, SrmError> {
        match credential_id {
            Some(id) => self.credentials.resolve(self.persistence.as_ref(), id).await,
            None => Ok(None),
        }
    }
}
