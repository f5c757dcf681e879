// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File requests: the per-file children of a container request.
//!
//! The set of kinds is fixed by the protocol, so [`FileRequest`] is a closed
//! enum over the four implementations. Each implementation keeps its
//! immutable identity (id, owning request, SURL) outside its lock and every
//! mutable field inside a single `tokio::sync::Mutex`.
//!
//! All four follow the same resource protocol: `run` checks the handle it
//! needs next (file id, pin, space token, transfer), and when it is missing
//! moves to ASYNCWAIT and spawns the backend call. The completion stores the
//! handle and hands the job back to its scheduler, which runs it again.
//! Transient backend errors are parked on the job and raised by the next
//! `run`, so they go through the regular retry budget.

pub mod bring_online;
pub mod copy;
pub mod get;
pub mod put;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::context::SrmContext;
use crate::error::SrmError;
use crate::job::{self, JobData, JobGuard, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::status::{ReturnStatus, StatusCode};
use crate::storage::StorageError;

pub use bring_online::{BringOnlineFileRequest, BringOnlineFileState};
pub use copy::{CopyDirection, CopyFileRequest, CopyFileState};
pub use get::{GetFileRequest, GetFileState};
pub use put::{PutFileRequest, PutFileState};

/// One file of a container request.
#[derive(Clone)]
pub enum FileRequest {
    Get(Arc<GetFileRequest>),
    Put(Arc<PutFileRequest>),
    BringOnline(Arc<BringOnlineFileRequest>),
    Copy(Arc<CopyFileRequest>),
}

/// Client facing status of one file request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub file_request_id: JobId,
    pub surl: String,
    /// Copy destination.
    pub destination: Option<String>,
    pub turl: Option<String>,
    pub state: State,
    pub status: ReturnStatus,
    pub size: Option<u64>,
    pub remaining_lifetime_secs: i64,
    /// Suggested delay before the client polls again.
    pub estimated_wait_secs: Option<u64>,
}

impl FileRequest {
    pub fn id(&self) -> JobId {
        match self {
            FileRequest::Get(f) => f.id(),
            FileRequest::Put(f) => f.id(),
            FileRequest::BringOnline(f) => f.id(),
            FileRequest::Copy(f) => f.id(),
        }
    }

    /// Owning container request.
    pub fn request_id(&self) -> JobId {
        match self {
            FileRequest::Get(f) => f.request_id(),
            FileRequest::Put(f) => f.request_id(),
            FileRequest::BringOnline(f) => f.request_id(),
            FileRequest::Copy(f) => f.request_id(),
        }
    }

    /// The file this request is about; the source of a copy.
    pub fn surl(&self) -> &str {
        match self {
            FileRequest::Get(f) => f.surl(),
            FileRequest::Put(f) => f.surl(),
            FileRequest::BringOnline(f) => f.surl(),
            FileRequest::Copy(f) => f.surl(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            FileRequest::Get(_) => JobKind::GetFile,
            FileRequest::Put(_) => JobKind::PutFile,
            FileRequest::BringOnline(_) => JobKind::BringOnlineFile,
            FileRequest::Copy(_) => JobKind::CopyFile,
        }
    }

    /// Whether the request operates on `surl`, as source or destination.
    pub fn is_touching_surl(&self, surl: &str) -> bool {
        match self {
            FileRequest::Copy(f) => f.surl() == surl || f.destination() == surl,
            other => other.surl() == surl,
        }
    }

    pub async fn lock(&self) -> JobGuard<'_> {
        match self {
            FileRequest::Get(f) => JobGuard::Get(f.inner.lock().await),
            FileRequest::Put(f) => JobGuard::Put(f.inner.lock().await),
            FileRequest::BringOnline(f) => JobGuard::BringOnline(f.inner.lock().await),
            FileRequest::Copy(f) => JobGuard::Copy(f.inner.lock().await),
        }
    }

    pub async fn state(&self) -> State {
        self.lock().await.data().state()
    }

    /// Protocol status of this file. Side-effect free.
    pub async fn return_status(&self) -> ReturnStatus {
        match self {
            FileRequest::Get(f) => f.inner.lock().await.return_status(),
            FileRequest::Put(f) => f.inner.lock().await.return_status(),
            FileRequest::BringOnline(f) => f.inner.lock().await.return_status(),
            FileRequest::Copy(f) => f.inner.lock().await.return_status(),
        }
    }

    /// [`FileRequest::return_status`], giving up when the lock is not
    /// acquired within `timeout`.
    pub async fn return_status_within(
        &self,
        timeout: Duration,
    ) -> Result<ReturnStatus, SrmError> {
        tokio::time::timeout(timeout, self.return_status())
            .await
            .map_err(|_| SrmError::LockTimeout { job_id: self.id() })
    }

    /// Snapshot of the client facing status.
    pub async fn file_status(&self) -> FileStatus {
        match self {
            FileRequest::Get(f) => f.file_status().await,
            FileRequest::Put(f) => f.file_status().await,
            FileRequest::BringOnline(f) => f.file_status().await,
            FileRequest::Copy(f) => f.file_status().await,
        }
    }

    /// Cancel the file request.
    ///
    /// Finished requests are left alone, except a completed upload, whose
    /// abort fails.
    pub async fn abort(&self, ctx: &SrmContext, reason: &str) -> Result<(), SrmError> {
        if let FileRequest::Put(put) = self {
            return put.abort(ctx, reason).await;
        }
        let mut guard = self.lock().await;
        if guard.data().state().is_final() {
            return Ok(());
        }
        job::set_state(ctx, guard.body(), State::Canceled, reason, true).await
    }

    /// Extend the lifetime of the file request, and of the pin or space
    /// reservation it holds.
    ///
    /// A finished file request reports its own outcome. The container is
    /// then extended so that it outlives the file.
    pub async fn extend_lifetime(
        &self,
        ctx: &SrmContext,
        new_lifetime_millis: i64,
    ) -> Result<i64, SrmError> {
        let granted = match self {
            FileRequest::Get(f) => f.extend_lifetime(ctx, new_lifetime_millis).await?,
            FileRequest::Put(f) => f.extend_lifetime(ctx, new_lifetime_millis).await?,
            FileRequest::BringOnline(f) => f.extend_lifetime(ctx, new_lifetime_millis).await?,
            FileRequest::Copy(f) => {
                let mut guard = f.inner.lock().await;
                job::extend_lifetime_millis(ctx, &mut *guard, new_lifetime_millis).await?
            }
        };
        if let Ok(container) = ctx.jobs.container(&self.request_id()) {
            container.extend_lifetime_millis(ctx, granted).await?;
        }
        Ok(granted)
    }

    /// Release the pin held for a get or bring-online request.
    pub async fn release(&self, ctx: &SrmContext) -> ReturnStatus {
        match self {
            FileRequest::Get(f) => f.release(ctx).await,
            FileRequest::BringOnline(f) => f.release(ctx).await,
            _ => ReturnStatus::new(
                StatusCode::NotSupported,
                format!("{} requests hold no pin to release", self.kind()),
            ),
        }
    }

    /// Rebuild a file request from its persisted record.
    pub fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let request = match record.kind {
            JobKind::GetFile => FileRequest::Get(Arc::new(GetFileRequest::restore(record)?)),
            JobKind::PutFile => FileRequest::Put(Arc::new(PutFileRequest::restore(record)?)),
            JobKind::BringOnlineFile => {
                FileRequest::BringOnline(Arc::new(BringOnlineFileRequest::restore(record)?))
            }
            JobKind::CopyFile => FileRequest::Copy(Arc::new(CopyFileRequest::restore(record)?)),
            other => {
                return Err(SrmError::WrongJobKind {
                    job_id: record.id,
                    expected: format!("file request, found {}", other),
                });
            }
        };
        Ok(request)
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("surl", &self.surl())
            .finish()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Parent id of a persisted file request.
pub(crate) fn parent_of(record: &JobRecord) -> Result<JobId, SrmError> {
    record.parent_id.ok_or_else(|| SrmError::ValidationError {
        field: "parent_id".to_string(),
        message: format!("file request {} has no container request", record.id),
    })
}

/// Whether any requested protocol is offered by the storage.
///
/// An empty request list accepts whatever the storage offers.
pub(crate) fn protocols_supported(requested: &[String], supported: &[String]) -> bool {
    requested.is_empty() || requested.iter().any(|p| supported.contains(p))
}

/// Notify the owning container of a child state change.
///
/// Lock free: the container is resolved by id and only its change counter
/// and retry hint are touched.
pub(crate) fn notify_container(ctx: &SrmContext, request_id: JobId, new: State) {
    match ctx.jobs.container(&request_id) {
        Ok(container) => {
            if new == State::Ready {
                container.reset_retry_delta();
            }
            container.file_request_state_changed(new);
        }
        Err(e) => debug!(request_id = %request_id, error = %e, "Container not in memory"),
    }
}

/// Remaining lifetime of the job as a backend lease duration, at least one
/// second.
pub(crate) fn remaining_lease(data: &JobData) -> Duration {
    let millis = data.remaining_lifetime().num_milliseconds().max(1_000);
    Duration::from_millis(millis as u64)
}

/// Await a backend call outside any job lock, bounded by the storage timeout.
pub(crate) async fn call_storage<T, F>(ctx: &SrmContext, call: F) -> Result<T, StorageError>
where
    F: std::future::Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(ctx.config.storage_timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("Storage call timed out");
            Err(StorageError::Timeout)
        }
    }
}
