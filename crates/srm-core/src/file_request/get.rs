// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Download preparation: resolve the file, pin it, hand out a TURL.
//!
//! The scheduler moves a get request that finished `run` through RQUEUED to
//! READY once a ready slot is free. The client then downloads from the TURL
//! and releases the file, which completes the request and drops the pin.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::callbacks::{Completion, spawn_backend_call, spawn_compensation};
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::job::{self, JobBody, JobData, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::request::{RequestOptions, SrmUser};
use crate::status::{ReturnStatus, StatusCode};
use crate::storage::StorageError;

use super::{
    FileStatus, call_storage, notify_container, parent_of, protocols_supported, remaining_lease,
};

/// Persisted fields of a get request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPayload {
    pub surl: String,
    pub user: SrmUser,
    #[serde(default)]
    pub protocols: Vec<String>,
    pub desired_pin_lifetime: Option<Duration>,
    pub file_id: Option<String>,
    pub pin_id: Option<String>,
    pub turl: Option<String>,
    pub size: Option<u64>,
}

/// A file to be prepared for download.
pub struct GetFileRequest {
    id: JobId,
    request_id: JobId,
    surl: String,
    pub(crate) inner: Mutex<GetFileState>,
}

/// Mutable part of a [`GetFileRequest`].
pub struct GetFileState {
    pub(crate) data: JobData,
    pub(crate) request_id: JobId,
    pub(crate) payload: GetPayload,
    pub(crate) pending_error: Option<StorageError>,
}

impl GetFileRequest {
    pub fn new(
        request_id: JobId,
        surl: impl Into<String>,
        user: SrmUser,
        options: &RequestOptions,
        lifetime: TimeDelta,
        max_retries: u32,
    ) -> Self {
        let surl = surl.into();
        let data = JobData::new(JobKind::GetFile, lifetime, max_retries);
        let payload = GetPayload {
            surl: surl.clone(),
            user,
            protocols: options.protocols.clone(),
            desired_pin_lifetime: options.desired_pin_lifetime,
            file_id: None,
            pin_id: None,
            turl: None,
            size: None,
        };
        Self {
            id: data.id(),
            request_id,
            surl,
            inner: Mutex::new(GetFileState {
                data,
                request_id,
                payload,
                pending_error: None,
            }),
        }
    }

    pub(crate) fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let payload: GetPayload = serde_json::from_value(record.payload.clone())?;
        let request_id = parent_of(record)?;
        Ok(Self {
            id: record.id,
            request_id,
            surl: payload.surl.clone(),
            inner: Mutex::new(GetFileState {
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

    pub fn surl(&self) -> &str {
        &self.surl
    }

    pub async fn file_status(&self) -> FileStatus {
        let state = self.inner.lock().await;
        let ready = matches!(state.data.state, State::Ready | State::Transferring);
        FileStatus {
            file_request_id: self.id,
            surl: self.surl.clone(),
            destination: None,
            turl: state.payload.turl.clone().filter(|_| ready),
            state: state.data.state,
            status: state.return_status(),
            size: state.payload.size,
            remaining_lifetime_secs: state.data.remaining_lifetime().num_seconds(),
            estimated_wait_secs: None,
        }
    }

    /// Extend the request lifetime and the pin along with it.
    pub async fn extend_lifetime(
        &self,
        ctx: &SrmContext,
        new_lifetime_millis: i64,
    ) -> Result<i64, SrmError> {
        let (granted, pin) = {
            let mut state = self.inner.lock().await;
            let granted = job::extend_lifetime_millis(ctx, &mut *state, new_lifetime_millis).await?;
            let pin = match (&state.payload.file_id, &state.payload.pin_id) {
                (Some(file_id), Some(pin_id)) if granted == new_lifetime_millis => Some((
                    state.payload.user.clone(),
                    file_id.clone(),
                    pin_id.clone(),
                )),
                _ => None,
            };
            (granted, pin)
        };

        if let Some((user, file_id, pin_id)) = pin {
            let lifetime = Duration::from_millis(granted.max(0) as u64);
            if let Err(e) = call_storage(
                ctx,
                ctx.storage.extend_pin_lifetime(&user, &file_id, &pin_id, lifetime),
            )
            .await
            {
                warn!(job_id = %self.id, error = %e, "Failed to extend pin lifetime");
            }
        }
        Ok(granted)
    }

    /// Release the file: a prepared download completes, a pending one is
    /// aborted.
    pub async fn release(&self, ctx: &SrmContext) -> ReturnStatus {
        let mut state = self.inner.lock().await;
        let outcome = match state.data.state {
            State::Ready | State::Transferring => {
                job::set_state(ctx, &mut *state, State::Done, "TURL released.", true)
                    .await
                    .map(|_| ReturnStatus::success())
            }
            State::Done => Ok(ReturnStatus::success()),
            State::Canceled => Ok(ReturnStatus::new(
                StatusCode::Aborted,
                "SURL has been aborted and cannot be released".to_string(),
            )),
            State::Failed => Ok(ReturnStatus::new(
                StatusCode::Failure,
                "Pinning failed".to_string(),
            )),
            _ => job::set_state(
                ctx,
                &mut *state,
                State::Canceled,
                "Aborted by srmReleaseFile request.",
                true,
            )
            .await
            .map(|_| {
                ReturnStatus::new(
                    StatusCode::Aborted,
                    "SURL is not yet pinned, pinning aborted".to_string(),
                )
            }),
        };
        outcome.unwrap_or_else(|e| ReturnStatus::new(StatusCode::Failure, e.to_string()))
    }
}

impl GetFileState {
    pub(crate) fn return_status(&self) -> ReturnStatus {
        let description = Some(self.data.latest_description());
        if let Some(code) = self.data.status_code {
            return match code {
                StatusCode::FilePinned | StatusCode::Success | StatusCode::Released => {
                    ReturnStatus::bare(code)
                }
                _ => ReturnStatus::new(code, description),
            };
        }
        match self.data.state {
            State::Pending | State::TQueued | State::RetryWait => {
                ReturnStatus::new(StatusCode::RequestQueued, description)
            }
            State::Ready | State::Transferring => ReturnStatus::bare(StatusCode::FilePinned),
            State::Done => ReturnStatus::bare(StatusCode::Released),
            State::Canceled => ReturnStatus::new(StatusCode::Aborted, description),
            State::Failed => ReturnStatus::new(StatusCode::Failure, description),
            _ => ReturnStatus::new(StatusCode::RequestInProgress, description),
        }
    }

    async fn completion_failed(
        &mut self,
        ctx: &SrmContext,
        err: StorageError,
    ) -> Result<bool, SrmError> {
        if err.is_transient() {
            self.pending_error = Some(err);
            return Ok(self.data.state == State::AsyncWait);
        }
        let message = err.to_string();
        job::set_state_and_status(ctx, self, State::Failed, &message, err.status_code()).await?;
        Ok(false)
    }
}

#[async_trait::async_trait]
impl JobBody for GetFileState {
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
        if let Some(err) = self.pending_error.take() {
            return Err(err.into());
        }
        let job_id = self.data.id;

        if self.payload.file_id.is_none() {
            let supported = ctx.storage.supported_get_protocols();
            if !protocols_supported(&self.payload.protocols, &supported) {
                return Err(JobFailure::fatal(
                    format!(
                        "Transfer protocols not supported: {}",
                        self.payload.protocols.join(", ")
                    ),
                    StatusCode::NotSupported,
                ));
            }
            if ctx.uploads.is_busy(&self.payload.surl) {
                job::set_state_and_status(
                    ctx,
                    self,
                    State::Failed,
                    "The requested SURL is locked by an upload.",
                    StatusCode::FileBusy,
                )
                .await?;
                return Ok(());
            }

            job::set_state(ctx, self, State::AsyncWait, "getting file Id", false).await?;
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            let surl = self.payload.surl.clone();
            spawn_backend_call(
                ctx,
                job_id,
                async move { storage.get_file_info(&user, &surl).await },
                Completion::FileInfo,
            );
            return Ok(());
        }

        if self.payload.pin_id.is_none() {
            job::set_state(ctx, self, State::AsyncWait, "pinning file", false).await?;
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            let surl = self.payload.surl.clone();
            let lifetime = self
                .payload
                .desired_pin_lifetime
                .unwrap_or_else(|| remaining_lease(&self.data));
            let request_id = self.request_id;
            spawn_backend_call(
                ctx,
                job_id,
                async move { storage.pin_file(&user, &surl, lifetime, request_id).await },
                Completion::Pin,
            );
            return Ok(());
        }

        if self.payload.turl.is_none() {
            let turl = call_storage(
                ctx,
                ctx.storage
                    .get_turl(&self.payload.user, &self.payload.surl, &self.payload.protocols),
            )
            .await?;
            debug!(job_id = %job_id, turl = %turl, "TURL computed");
            self.payload.turl = Some(turl);
        }
        Ok(())
    }

    fn state_changed(&mut self, ctx: &SrmContext, _old: State) {
        let state = self.data.state;
        notify_container(ctx, self.request_id, state);

        if state.is_final()
            && let (Some(file_id), Some(pin_id)) =
                (self.payload.file_id.clone(), self.payload.pin_id.clone())
        {
            let storage = ctx.storage.clone();
            let user = self.payload.user.clone();
            spawn_compensation(ctx, self.data.id, "unpin", async move {
                storage.unpin_file(&user, &file_id, &pin_id).await
            });
        }
    }

    async fn on_completion(
        &mut self,
        ctx: &SrmContext,
        completion: Completion,
    ) -> Result<bool, SrmError> {
        match completion {
            Completion::FileInfo(Ok(metadata)) => {
                if self.data.state != State::AsyncWait {
                    return Ok(false);
                }
                if metadata.is_directory {
                    job::set_state_and_status(
                        ctx,
                        self,
                        State::Failed,
                        "Path is a directory",
                        StatusCode::InvalidPath,
                    )
                    .await?;
                    return Ok(false);
                }
                self.payload.file_id = Some(metadata.file_id);
                self.payload.size = Some(metadata.size);
                Ok(true)
            }
            Completion::Pin(Ok(pin)) => {
                if self.data.state != State::AsyncWait {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, pin_id = %pin.pin_id, "File pinned");
                self.payload.file_id = Some(pin.file_id);
                self.payload.pin_id = Some(pin.pin_id);
                job::save_job(ctx, self, false).await;
                Ok(true)
            }
            Completion::FileInfo(Err(e)) | Completion::Pin(Err(e)) => {
                self.completion_failed(ctx, e).await
            }
            other => {
                warn!(job_id = %self.data.id, completion = other.name(), "Unexpected completion ignored");
                Ok(false)
            }
        }
    }
}
