// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live job lookup by id, and active uploads by SURL.
//!
//! Jobs never hold references to each other across a lock scope; they hold
//! ids and resolve them here.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::container::ContainerRequest;
use crate::error::SrmError;
use crate::file_request::FileRequest;
use crate::job::{Job, JobId};
use crate::reserve_space::ReserveSpaceRequest;

/// Jobs currently held in memory.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, and the file requests of a container.
    pub fn register(&self, job: Job) {
        if let Job::Container(container) = &job {
            for file in container.file_requests() {
                self.jobs.insert(file.id(), Job::File(file.clone()));
            }
        }
        self.jobs.insert(job.id(), job);
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Drop a job, and the file requests of a container.
    pub fn remove(&self, id: &JobId) -> Option<Job> {
        let removed = self.jobs.remove(id).map(|(_, job)| job);
        if let Some(Job::Container(container)) = &removed {
            for file in container.file_requests() {
                self.jobs.remove(&file.id());
            }
        }
        removed
    }

    pub fn container(&self, id: &JobId) -> Result<Arc<ContainerRequest>, SrmError> {
        match self.get(id) {
            Some(Job::Container(container)) => Ok(container),
            Some(_) => Err(SrmError::WrongJobKind {
                job_id: *id,
                expected: "container request".to_string(),
            }),
            None => Err(SrmError::JobNotFound {
                job_id: id.to_string(),
            }),
        }
    }

    pub fn file_request(&self, id: &JobId) -> Result<FileRequest, SrmError> {
        match self.get(id) {
            Some(Job::File(file)) => Ok(file),
            Some(_) => Err(SrmError::WrongJobKind {
                job_id: *id,
                expected: "file request".to_string(),
            }),
            None => Err(SrmError::JobNotFound {
                job_id: id.to_string(),
            }),
        }
    }

    pub fn reserve_space(&self, id: &JobId) -> Result<Arc<ReserveSpaceRequest>, SrmError> {
        match self.get(id) {
            Some(Job::ReserveSpace(request)) => Ok(request),
            Some(_) => Err(SrmError::WrongJobKind {
                job_id: *id,
                expected: "space reservation".to_string(),
            }),
            None => Err(SrmError::JobNotFound {
                job_id: id.to_string(),
            }),
        }
    }

    /// Snapshot of every live job.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of the top-level jobs: containers and reservations.
    pub fn requests(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| !matches!(entry.value(), Job::File(_)))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// SURLs with an upload in progress, and the file request holding each.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    uploads: DashMap<String, JobId>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `surl` for `job_id`.
    ///
    /// Returns the id of the other job if the SURL is already claimed.
    pub fn register(&self, surl: &str, job_id: JobId) -> Result<(), JobId> {
        match self.uploads.entry(surl.to_string()) {
            Entry::Occupied(entry) if *entry.get() != job_id => Err(*entry.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(job_id);
                Ok(())
            }
        }
    }

    /// Release `surl`, only if it is held by `job_id`.
    pub fn unregister(&self, surl: &str, job_id: JobId) {
        self.uploads.remove_if(surl, |_, holder| *holder == job_id);
    }

    pub fn holder(&self, surl: &str) -> Option<JobId> {
        self.uploads.get(surl).map(|entry| *entry.value())
    }

    pub fn is_busy(&self, surl: &str) -> bool {
        self.uploads.contains_key(surl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_registry_claims_are_exclusive() {
        let uploads = UploadRegistry::new();
        let first = JobId::new();
        let second = JobId::new();

        assert!(uploads.register("srm://host/a", first).is_ok());
        assert!(uploads.register("srm://host/a", first).is_ok());
        assert_eq!(uploads.register("srm://host/a", second), Err(first));
        assert!(uploads.is_busy("srm://host/a"));

        uploads.unregister("srm://host/a", second);
        assert_eq!(uploads.holder("srm://host/a"), Some(first));

        uploads.unregister("srm://host/a", first);
        assert!(!uploads.is_busy("srm://host/a"));
        assert!(uploads.register("srm://host/a", second).is_ok());
    }

    #[test]
    fn test_missing_job_lookups() {
        let jobs = JobRegistry::new();
        let id = JobId::new();
        assert!(matches!(
            jobs.container(&id),
            Err(SrmError::JobNotFound { .. })
        ));
        assert!(matches!(
            jobs.file_request(&id),
            Err(SrmError::JobNotFound { .. })
        ));
        assert!(jobs.is_empty());
    }
}
