// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging: pin a file online for a bounded time.
//!
//! Unlike a get, a bring-online request completes as soon as the pin is
//! granted. The pin outlives the request and is dropped either by an
//! explicit release or when it expires in the storage system.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

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

/// Persisted fields of a bring-online request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BringOnlinePayload {
    pub surl: String,
    pub user: SrmUser,
    #[serde(default)]
    pub protocols: Vec<String>,
    pub desired_pin_lifetime: Option<Duration>,
    pub file_id: Option<String>,
    pub pin_id: Option<String>,
}

/// A file to be brought online.
pub struct BringOnlineFileRequest {
    id: JobId,
    request_id: JobId,
    surl: String,
    pub(crate) inner: Mutex<BringOnlineFileState>,
}

/// Mutable part of a [`BringOnlineFileRequest`].
pub struct BringOnlineFileState {
    pub(crate) data: JobData,
    pub(crate) request_id: JobId,
    pub(crate) payload: BringOnlinePayload,
    pub(crate) pending_error: Option<StorageError>,
}

impl BringOnlineFileRequest {
    pub fn new(
        request_id: JobId,
        surl: impl Into<String>,
        user: SrmUser,
        options: &RequestOptions,
        lifetime: TimeDelta,
        max_retries: u32,
    ) -> Self {
        let surl = surl.into();
        let data = JobData::new(JobKind::BringOnlineFile, lifetime, max_retries);
        let payload = BringOnlinePayload {
            surl: surl.clone(),
            user,
            protocols: options.protocols.clone(),
            desired_pin_lifetime: options.desired_pin_lifetime,
            file_id: None,
            pin_id: None,
        };
        Self {
            id: data.id(),
            request_id,
            surl,
            inner: Mutex::new(BringOnlineFileState {
                data,
                request_id,
                payload,
                pending_error: None,
            }),
        }
    }

    pub(crate) fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let payload: BringOnlinePayload = serde_json::from_value(record.payload.clone())?;
        let request_id = parent_of(record)?;
        Ok(Self {
            id: record.id,
            request_id,
            surl: payload.surl.clone(),
            inner: Mutex::new(BringOnlineFileState {
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

    pub async fn pin_id(&self) -> Option<String> {
        self.inner.lock().await.payload.pin_id.clone()
    }

    pub async fn file_status(&self) -> FileStatus {
        let state = self.inner.lock().await;
        FileStatus {
            file_request_id: self.id,
            surl: self.surl.clone(),
            destination: None,
            turl: None,
            state: state.data.state,
            status: state.return_status(),
            size: None,
            remaining_lifetime_secs: state.data.remaining_lifetime().num_seconds(),
            estimated_wait_secs: None,
        }
    }

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

    /// Release the pin of a completed request, or abort a pending one.
    ///
    /// The unpin call is made without holding the job's lock.
    pub async fn release(&self, ctx: &SrmContext) -> ReturnStatus {
        let (user, file_id, pin_id) = {
            let mut state = self.inner.lock().await;
            match state.data.state {
                State::Done => match (&state.payload.file_id, &state.payload.pin_id) {
                    (Some(file_id), Some(pin_id)) => (
                        state.payload.user.clone(),
                        file_id.clone(),
                        pin_id.clone(),
                    ),
                    _ => {
                        return ReturnStatus::new(
                            StatusCode::Failure,
                            "SURL is not pinned".to_string(),
                        );
                    }
                },
                State::Canceled => {
                    return ReturnStatus::new(
                        StatusCode::Aborted,
                        "SURL has been aborted and cannot be released".to_string(),
                    );
                }
                State::Failed => {
                    return ReturnStatus::new(StatusCode::Failure, "Pinning failed".to_string());
                }
                _ => {
                    warn!(job_id = %self.id, "Canceled by release");
                    return match job::set_state(
                        ctx,
                        &mut *state,
                        State::Canceled,
                        "Aborted by srmReleaseFile request.",
                        true,
                    )
                    .await
                    {
                        Ok(()) => ReturnStatus::new(
                            StatusCode::Aborted,
                            "SURL is not yet pinned, pinning aborted".to_string(),
                        ),
                        Err(e) => ReturnStatus::new(StatusCode::Failure, e.to_string()),
                    };
                }
            }
        };

        debug!(job_id = %self.id, file_id = %file_id, pin_id = %pin_id, "Unpinning on release");
        match call_storage(ctx, ctx.storage.unpin_file(&user, &file_id, &pin_id)).await {
            Ok(()) => {
                let mut state = self.inner.lock().await;
                state.payload.pin_id = None;
                state.data.add_history_event("File released.");
                job::save_job(ctx, &mut *state, true).await;
                ReturnStatus::success()
            }
            Err(StorageError::Timeout) => {
                ReturnStatus::new(StatusCode::InternalError, "Operation timed out.".to_string())
            }
            Err(e) => ReturnStatus::new(
                StatusCode::Failure,
                format!("Failed to unpin SURL: {}", e),
            ),
        }
    }
}

impl BringOnlineFileState {
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
            State::Done if self.payload.pin_id.is_some() => ReturnStatus::success(),
            State::Done => ReturnStatus::bare(StatusCode::Released),
            State::Canceled => ReturnStatus::new(StatusCode::Aborted, description),
            State::Failed => ReturnStatus::new(StatusCode::Failure, description),
            _ => ReturnStatus::new(StatusCode::RequestInProgress, description),
        }
    }
}

#[async_trait::async_trait]
impl JobBody for BringOnlineFileState {
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
        if self.payload.pin_id.is_some() {
            info!(job_id = %self.data.id, "File already pinned");
            job::set_state(ctx, self, State::Done, "File is pinned.", true).await?;
            return Ok(());
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

        job::set_state(ctx, self, State::AsyncWait, "Pinning file.", false).await?;
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
            self.data.id,
            async move { storage.pin_file(&user, &surl, lifetime, request_id).await },
            Completion::Pin,
        );
        Ok(())
    }

    fn state_changed(&mut self, ctx: &SrmContext, _old: State) {
        let state = self.data.state;
        notify_container(ctx, self.request_id, state);

        if matches!(state, State::Canceled | State::Failed)
            && let (Some(file_id), Some(pin_id)) =
                (self.payload.file_id.clone(), self.payload.pin_id.clone())
        {
            info!(job_id = %self.data.id, file_id = %file_id, pin_id = %pin_id, "Unpinning after failure");
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
            Completion::Pin(Ok(pin)) => {
                if !matches!(self.data.state, State::AsyncWait | State::Running) {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, pin_id = %pin.pin_id, "File pinned");
                self.payload.file_id = Some(pin.file_id);
                self.payload.pin_id = Some(pin.pin_id);
                job::set_state(ctx, self, State::Done, "File is pinned.", true).await?;
                Ok(false)
            }
            Completion::Pin(Err(e)) if e.is_transient() => {
                self.pending_error = Some(e);
                Ok(self.data.state == State::AsyncWait)
            }
            Completion::Pin(Err(e)) => {
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
