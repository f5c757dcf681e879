// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Copies between this storage and itself or a remote one.
//!
//! Whenever the destination is local, an upload is prepared for it first
//! and committed with put-done once the data has arrived. Transfers carry a
//! transfer id. A failed transfer is parked on the job: the next `run`
//! kills what is left of it, drops the destination upload and raises the
//! error, so the copy goes through the regular retry budget.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::{
    Completion, spawn_backend_call, spawn_backend_call_within, spawn_compensation,
};
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::job::{self, JobBody, JobData, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::request::{NewFile, RequestData, RequestOptions, SrmUser};
use crate::status::{ReturnStatus, StatusCode};
use crate::storage::{StorageError, TransferDirection};

use super::{FileStatus, call_storage, notify_container, parent_of, remaining_lease};

/// Which ends of a copy live on this storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    LocalToLocal,
    RemoteToLocal,
    LocalToRemote,
}

impl CopyDirection {
    /// Direction of a copy from `source` to `destination`, as classified by
    /// `is_local`. Copies between two remote storages are refused.
    pub fn classify(
        source: &str,
        destination: &str,
        is_local: impl Fn(&str) -> bool,
    ) -> Result<Self, SrmError> {
        match (is_local(source), is_local(destination)) {
            (true, true) => Ok(Self::LocalToLocal),
            (false, true) => Ok(Self::RemoteToLocal),
            (true, false) => Ok(Self::LocalToRemote),
            (false, false) => Err(SrmError::invalid_request(format!(
                "neither {} nor {} is local to this storage",
                source, destination
            ))),
        }
    }

    fn writes_locally(&self) -> bool {
        matches!(self, Self::LocalToLocal | Self::RemoteToLocal)
    }
}

/// Persisted fields of a copy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyPayload {
    pub source: String,
    pub destination: String,
    pub direction: CopyDirection,
    /// Transfer URL of the remote end.
    pub remote_turl: Option<String>,
    pub size: Option<u64>,
    pub user: SrmUser,
    pub credential_id: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    /// Upload prepared for a local destination.
    pub dest_file_id: Option<String>,
    pub transfer_id: Option<String>,
}

/// A single file copy.
pub struct CopyFileRequest {
    id: JobId,
    request_id: JobId,
    source: String,
    destination: String,
    pub(crate) inner: Mutex<CopyFileState>,
}

impl std::fmt::Debug for CopyFileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyFileRequest")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish()
    }
}

/// Mutable part of a [`CopyFileRequest`].
pub struct CopyFileState {
    pub(crate) data: JobData,
    pub(crate) request_id: JobId,
    pub(crate) payload: CopyPayload,
    pub(crate) pending_error: Option<StorageError>,
}

impl CopyFileRequest {
    pub fn new(
        request_id: JobId,
        file: &NewFile,
        direction: CopyDirection,
        request: &RequestData,
        options: &RequestOptions,
        lifetime: TimeDelta,
        max_retries: u32,
    ) -> Result<Self, SrmError> {
        let destination = file
            .destination
            .clone()
            .ok_or_else(|| SrmError::ValidationError {
                field: "destination".to_string(),
                message: format!("copy of {} has no destination", file.surl),
            })?;
        let remote_turl = match direction {
            CopyDirection::LocalToLocal => None,
            CopyDirection::RemoteToLocal => {
                Some(file.remote_turl.clone().unwrap_or_else(|| file.surl.clone()))
            }
            CopyDirection::LocalToRemote => {
                Some(file.remote_turl.clone().unwrap_or_else(|| destination.clone()))
            }
        };
        let data = JobData::new(JobKind::CopyFile, lifetime, max_retries);
        let payload = CopyPayload {
            source: file.surl.clone(),
            destination: destination.clone(),
            direction,
            remote_turl,
            size: file.size,
            user: request.user.clone(),
            credential_id: request.credential_id.clone(),
            overwrite: options.overwrite,
            dest_file_id: None,
            transfer_id: None,
        };
        Ok(Self {
            id: data.id(),
            request_id,
            source: file.surl.clone(),
            destination,
            inner: Mutex::new(CopyFileState {
                data,
                request_id,
                payload,
                pending_error: None,
            }),
        })
    }

    pub(crate) fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let payload: CopyPayload = serde_json::from_value(record.payload.clone())?;
        let request_id = parent_of(record)?;
        Ok(Self {
            id: record.id,
            request_id,
            source: payload.source.clone(),
            destination: payload.destination.clone(),
            inner: Mutex::new(CopyFileState {
                data: JobData::from_record(record),
                request_id,
                payload,
                pending_error: None,
            }),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn request_id(&self) -> JobId {
        self.request_id
    }

    /// Source SURL.
    pub fn surl(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn file_status(&self) -> FileStatus {
        let state = self.inner.lock().await;
        let mut status = state.return_status();
        if status.code == StatusCode::SpaceLifetimeExpired {
            status = ReturnStatus::bare(StatusCode::Failure);
        }
        FileStatus {
            file_request_id: self.id,
            surl: self.source.clone(),
            destination: Some(self.destination.clone()),
            turl: None,
            state: state.data.state,
            status,
            size: state.payload.size,
            remaining_lifetime_secs: state.data.remaining_lifetime().num_seconds(),
            estimated_wait_secs: None,
        }
    }
}

impl CopyFileState {
    pub(crate) fn return_status(&self) -> ReturnStatus {
        let description = Some(self.data.latest_description());
        if let Some(code) = self.data.status_code {
            return ReturnStatus::new(code, description);
        }
        match self.data.state {
            State::Pending
            | State::TQueued
            | State::PriorityTQueued
            | State::RetryWait
            | State::Restored => ReturnStatus::new(StatusCode::RequestQueued, description),
            State::Done => ReturnStatus::success(),
            State::Canceled => ReturnStatus::new(StatusCode::Aborted, description),
            State::Failed => ReturnStatus::new(StatusCode::Failure, description),
            _ => ReturnStatus::new(StatusCode::RequestInProgress, description),
        }
    }

    pub fn transfer_id(&self) -> Option<&str> {
        self.payload.transfer_id.as_deref()
    }

    pub fn dest_file_id(&self) -> Option<&str> {
        self.payload.dest_file_id.as_deref()
    }

    /// Kill a leftover transfer and drop the destination upload before
    /// starting over. Awaited, so the next prepare-to-put cannot race the
    /// cleanup.
    async fn reset_transfer(&mut self, ctx: &SrmContext) {
        let job_id = self.data.id;
        if let Some(transfer_id) = self.payload.transfer_id.take() {
            info!(job_id = %job_id, transfer_id = %transfer_id, "Killing previous transfer");
            if let Err(e) = call_storage(ctx, ctx.storage.kill_transfer(&transfer_id)).await {
                warn!(job_id = %job_id, transfer_id = %transfer_id, error = %e, "Failed to kill transfer");
            }
            if let Some(file_id) = self.payload.dest_file_id.take() {
                let outcome = call_storage(
                    ctx,
                    ctx.storage.abort_put(
                        &self.payload.user,
                        &file_id,
                        &self.payload.destination,
                        "transfer restarted",
                    ),
                )
                .await;
                if let Err(e) = outcome {
                    warn!(job_id = %job_id, error = %e, "Failed to abort destination upload");
                }
            }
        }
    }

    async fn start_transfer(&mut self, ctx: &SrmContext) -> Result<(), JobFailure> {
        let job_id = self.data.id;
        let credential = ctx.credential(self.payload.credential_id.as_deref()).await?;
        let transfer_id = Uuid::new_v4().to_string();
        self.payload.transfer_id = Some(transfer_id.clone());

        let storage = ctx.storage.clone();
        let user = self.payload.user.clone();
        let source = self.payload.source.clone();
        let destination = self.payload.destination.clone();
        let remote_turl = self.payload.remote_turl.clone().unwrap_or_default();
        let dest_file_id = self.payload.dest_file_id.clone().unwrap_or_default();
        let lease = remaining_lease(&self.data);

        match self.payload.direction {
            CopyDirection::LocalToLocal => {
                job::set_state(ctx, self, State::AsyncWait, "Copying file.", true).await?;
                spawn_backend_call(
                    ctx,
                    job_id,
                    async move {
                        storage.local_copy(&user, &source, &dest_file_id).await?;
                        storage.put_done(&user, &dest_file_id, &destination).await
                    },
                    Completion::Transfer,
                );
            }
            CopyDirection::RemoteToLocal => {
                job::set_state(
                    ctx,
                    self,
                    State::AsyncWait,
                    "started remote transfer, waiting completion",
                    true,
                )
                .await?;
                let direction = TransferDirection::Pull {
                    remote_turl,
                    local_surl: destination.clone(),
                    file_id: dest_file_id.clone(),
                };
                spawn_backend_call_within(
                    ctx,
                    job_id,
                    lease,
                    async move {
                        storage
                            .transfer(&user, &transfer_id, direction, credential)
                            .await?;
                        storage.put_done(&user, &dest_file_id, &destination).await
                    },
                    Completion::Transfer,
                );
            }
            CopyDirection::LocalToRemote => {
                job::set_state(ctx, self, State::AsyncWait, "Transferring file.", true).await?;
                let direction = TransferDirection::Push {
                    local_surl: source,
                    remote_turl,
                };
                spawn_backend_call_within(
                    ctx,
                    job_id,
                    lease,
                    async move {
                        storage
                            .transfer(&user, &transfer_id, direction, credential)
                            .await
                    },
                    Completion::Transfer,
                );
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobBody for CopyFileState {
    fn data(&self) -> &JobData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut JobData {
        &mut self.data
    }

    fn parent_id(&self) -> Option<JobId> {
        Some(self.request_id)
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or_default()
    }

    async fn run(&mut self, ctx: &SrmContext) -> Result<(), JobFailure> {
        let error = self.pending_error.take();
        self.reset_transfer(ctx).await;
        if let Some(err) = error {
            return Err(err.into());
        }
        let job_id = self.data.id;
        let direction = self.payload.direction;

        if direction == CopyDirection::LocalToLocal && self.payload.size.is_none() {
            job::set_state(ctx, self, State::AsyncWait, "Getting source file info.", false)
                .await?;
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            let source = self.payload.source.clone();
            spawn_backend_call(
                ctx,
                job_id,
                async move { storage.get_file_info(&user, &source).await },
                Completion::FileInfo,
            );
            return Ok(());
        }

        if direction.writes_locally() && self.payload.dest_file_id.is_none() {
            job::set_state(ctx, self, State::AsyncWait, "Doing name space lookup.", false)
                .await?;
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            let destination = self.payload.destination.clone();
            let size = self.payload.size;
            let overwrite = self.payload.overwrite;
            spawn_backend_call(
                ctx,
                job_id,
                async move {
                    storage
                        .prepare_to_put(&user, &destination, size, overwrite)
                        .await
                },
                Completion::PrepareToPut,
            );
            return Ok(());
        }

        self.start_transfer(ctx).await
    }

    fn state_changed(&mut self, ctx: &SrmContext, _old: State) {
        let state = self.data.state;
        notify_container(ctx, self.request_id, state);
        if !state.is_final() || state == State::Done {
            return;
        }

        let job_id = self.data.id;
        if let Some(transfer_id) = self.payload.transfer_id.take() {
            let storage = ctx.storage.clone();
            spawn_compensation(ctx, job_id, "kill transfer", async move {
                storage.kill_transfer(&transfer_id).await
            });
        }
        if let Some(file_id) = self.payload.dest_file_id.take() {
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            let destination = self.payload.destination.clone();
            let reason = self.data.latest_description();
            spawn_compensation(ctx, job_id, "abort destination upload", async move {
                storage.abort_put(&user, &file_id, &destination, &reason).await
            });
        }
    }

    async fn on_completion(
        &mut self,
        ctx: &SrmContext,
        completion: Completion,
    ) -> Result<bool, SrmError> {
        let waiting = self.data.state == State::AsyncWait;
        match completion {
            Completion::FileInfo(Ok(metadata)) => {
                if !waiting {
                    return Ok(false);
                }
                if metadata.is_directory {
                    job::set_state_and_status(
                        ctx,
                        self,
                        State::Failed,
                        "Source is a directory",
                        StatusCode::InvalidPath,
                    )
                    .await?;
                    return Ok(false);
                }
                self.payload.size = Some(metadata.size);
                Ok(true)
            }
            Completion::PrepareToPut(Ok(upload)) => {
                if !waiting {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, file_id = %upload.file_id, "Destination prepared");
                self.payload.dest_file_id = Some(upload.file_id);
                job::save_job(ctx, self, true).await;
                Ok(true)
            }
            Completion::Transfer(Ok(())) => {
                if !waiting {
                    return Ok(false);
                }
                self.payload.transfer_id = None;
                self.payload.dest_file_id = None;
                job::set_state(ctx, self, State::Done, "completed", true).await?;
                Ok(false)
            }
            Completion::Transfer(Err(e)) => {
                warn!(job_id = %self.data.id, error = %e, "Transfer failed");
                self.pending_error = Some(e);
                Ok(waiting)
            }
            Completion::FileInfo(Err(e)) | Completion::PrepareToPut(Err(e)) => {
                if e.is_transient() {
                    self.pending_error = Some(e);
                    return Ok(waiting);
                }
                let message = e.to_string();
                job::set_state_and_status(ctx, self, State::Failed, &message, e.status_code())
                    .await?;
                Ok(false)
            }
            other => {
                warn!(job_id = %self.data.id, completion = other.name(), "Unexpected completion ignored");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(surl: &str) -> bool {
        surl.starts_with("srm://local/")
    }

    #[test]
    fn test_copy_direction_classification() {
        assert_eq!(
            CopyDirection::classify("srm://local/a", "srm://local/b", local).unwrap(),
            CopyDirection::LocalToLocal
        );
        assert_eq!(
            CopyDirection::classify("gsiftp://far/a", "srm://local/b", local).unwrap(),
            CopyDirection::RemoteToLocal
        );
        assert_eq!(
            CopyDirection::classify("srm://local/a", "gsiftp://far/b", local).unwrap(),
            CopyDirection::LocalToRemote
        );
        assert!(CopyDirection::classify("gsiftp://far/a", "gsiftp://far/b", local).is_err());
    }

    #[test]
    fn test_remote_turl_defaults_to_remote_surl() {
        let request = RequestData::new(SrmUser::new("alice"), "client");
        let options = RequestOptions::default();
        let file = NewFile::new("gsiftp://far/a").with_destination("srm://local/b");
        let copy = CopyFileRequest::new(
            JobId::new(),
            &file,
            CopyDirection::RemoteToLocal,
            &request,
            &options,
            TimeDelta::hours(1),
            3,
        )
        .unwrap();
        let state = copy.inner.try_lock().unwrap();
        assert_eq!(state.payload.remote_turl.as_deref(), Some("gsiftp://far/a"));
        assert_eq!(copy.destination(), "srm://local/b");
    }

    #[test]
    fn test_copy_without_destination_is_rejected() {
        let request = RequestData::new(SrmUser::new("alice"), "client");
        let err = CopyFileRequest::new(
            JobId::new(),
            &NewFile::new("srm://local/a"),
            CopyDirection::LocalToLocal,
            &request,
            &RequestOptions::default(),
            TimeDelta::hours(1),
            3,
        )
        .unwrap_err();
        assert!(matches!(err, SrmError::ValidationError { .. }));
    }

    #[test]
    fn test_copy_status_keeps_description_of_override() {
        let request = RequestData::new(SrmUser::new("alice"), "client");
        let file = NewFile::new("srm://local/a").with_destination("srm://local/b");
        let copy = CopyFileRequest::new(
            JobId::new(),
            &file,
            CopyDirection::LocalToLocal,
            &request,
            &RequestOptions::default(),
            TimeDelta::hours(1),
            3,
        )
        .unwrap();
        let mut state = copy.inner.try_lock().unwrap();
        assert_eq!(state.return_status().code, StatusCode::RequestQueued);

        state.data.status_code = Some(StatusCode::NoFreeSpace);
        let status = state.return_status();
        assert_eq!(status.code, StatusCode::NoFreeSpace);
        assert_eq!(status.explanation.as_deref(), Some("Request created"));
    }
}
