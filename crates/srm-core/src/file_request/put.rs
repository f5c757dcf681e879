// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload preparation.
//!
//! A put request claims its SURL in the upload registry, creates the upload
//! in the namespace, reserves space (implicitly, unless a space token was
//! given or inherited from the parent directory), marks the space as being
//! used by this upload and computes the TURL. The client then uploads and
//! calls put-done.
//!
//! Space is only released when this request reserved it; a reservation
//! named by the client or inherited from the directory is merely unmarked.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::callbacks::{Completion, spawn_backend_call, spawn_compensation};
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::job::{self, JobBody, JobData, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::request::{RequestOptions, SrmUser};
use crate::status::{ReturnStatus, StatusCode};
use crate::storage::{StorageBackend, StorageError};

use super::{
    FileStatus, call_storage, notify_container, parent_of, protocols_supported, remaining_lease,
};

/// Persisted fields of a put request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutPayload {
    pub surl: String,
    pub user: SrmUser,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub overwrite: bool,
    pub size: Option<u64>,
    pub file_id: Option<String>,
    pub space_token: Option<String>,
    /// Set when the reservation was made by this request.
    #[serde(default)]
    pub we_reserved_space: bool,
    #[serde(default)]
    pub space_marked: bool,
    pub turl: Option<String>,
}

impl PutPayload {
    fn reservation_size(&self) -> u64 {
        self.size.unwrap_or(0).max(1)
    }
}

/// A file to be uploaded.
pub struct PutFileRequest {
    id: JobId,
    request_id: JobId,
    surl: String,
    pub(crate) inner: Mutex<PutFileState>,
}

/// Mutable part of a [`PutFileRequest`].
pub struct PutFileState {
    pub(crate) data: JobData,
    pub(crate) request_id: JobId,
    pub(crate) payload: PutPayload,
    pub(crate) pending_error: Option<StorageError>,
}

impl PutFileRequest {
    pub fn new(
        request_id: JobId,
        surl: impl Into<String>,
        size: Option<u64>,
        user: SrmUser,
        options: &RequestOptions,
        lifetime: TimeDelta,
        max_retries: u32,
    ) -> Self {
        let surl = surl.into();
        let data = JobData::new(JobKind::PutFile, lifetime, max_retries);
        let payload = PutPayload {
            surl: surl.clone(),
            user,
            protocols: options.protocols.clone(),
            overwrite: options.overwrite,
            size,
            file_id: None,
            space_token: options.space_token.clone(),
            we_reserved_space: false,
            space_marked: false,
            turl: None,
        };
        Self {
            id: data.id(),
            request_id,
            surl,
            inner: Mutex::new(PutFileState {
                data,
                request_id,
                payload,
                pending_error: None,
            }),
        }
    }

    pub(crate) fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let payload: PutPayload = serde_json::from_value(record.payload.clone())?;
        let request_id = parent_of(record)?;
        Ok(Self {
            id: record.id,
            request_id,
            surl: payload.surl.clone(),
            inner: Mutex::new(PutFileState {
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
        let mut status = state.return_status();
        // Only meaningful at request level.
        if status.code == StatusCode::SpaceLifetimeExpired {
            status = ReturnStatus::bare(StatusCode::Failure);
        }
        FileStatus {
            file_request_id: self.id,
            surl: self.surl.clone(),
            destination: None,
            turl: state.payload.turl.clone().filter(|_| ready),
            state: state.data.state,
            status,
            size: state.payload.size,
            remaining_lifetime_secs: state.data.remaining_lifetime().num_seconds(),
            estimated_wait_secs: None,
        }
    }

    /// Cancel the upload. A completed upload cannot be aborted.
    pub async fn abort(&self, ctx: &SrmContext, reason: &str) -> Result<(), SrmError> {
        let mut state = self.inner.lock().await;
        match state.data.state {
            State::Done => Err(SrmError::IllegalStateTransition {
                job_id: self.id,
                from: State::Done,
                to: State::Canceled,
            }),
            s if s.is_final() => Ok(()),
            _ => job::set_state(ctx, &mut *state, State::Canceled, reason, true).await,
        }
    }

    /// The client finished uploading.
    ///
    /// Existence of the file is checked and the upload committed in the
    /// storage without holding the job's lock.
    pub async fn done(&self, ctx: &SrmContext) -> ReturnStatus {
        let (user, surl, file_id) = {
            let mut state = self.inner.lock().await;
            match state.data.state {
                State::Ready | State::Transferring => (
                    state.payload.user.clone(),
                    state.payload.surl.clone(),
                    state.payload.file_id.clone().unwrap_or_default(),
                ),
                other => return put_done_refused(ctx, &mut state, other).await,
            }
        };

        match call_storage(ctx, ctx.storage.exists(&user, &surl)).await {
            Ok(true) => {}
            Ok(false) => {
                let mut state = self.inner.lock().await;
                if let Err(e) = job::set_state_and_status(
                    ctx,
                    &mut *state,
                    State::Failed,
                    "SrmPutDone called when no file was uploaded.",
                    StatusCode::InvalidPath,
                )
                .await
                {
                    warn!(job_id = %self.id, error = %e, "Failed to fail upload");
                }
                return ReturnStatus::new(
                    StatusCode::InvalidPath,
                    "File does not exist.".to_string(),
                );
            }
            Err(StorageError::Timeout) => {
                return ReturnStatus::new(
                    StatusCode::InternalError,
                    "Operation timed out.".to_string(),
                );
            }
            Err(e) => return ReturnStatus::new(e.status_code(), e.to_string()),
        }

        if let Err(e) = call_storage(ctx, ctx.storage.put_done(&user, &file_id, &surl)).await {
            return ReturnStatus::new(e.status_code(), e.to_string());
        }

        let mut state = self.inner.lock().await;
        match state.data.state {
            State::Ready | State::Transferring => {
                match job::set_state(ctx, &mut *state, State::Done, "SrmPutDone called.", true)
                    .await
                {
                    Ok(()) => ReturnStatus::success(),
                    Err(_) => ReturnStatus::new(
                        StatusCode::Failure,
                        "Scheduling failure.".to_string(),
                    ),
                }
            }
            other => put_done_refused(ctx, &mut state, other).await,
        }
    }

    /// Extend the request lifetime, and the reservation if this request
    /// made it.
    pub async fn extend_lifetime(
        &self,
        ctx: &SrmContext,
        new_lifetime_millis: i64,
    ) -> Result<i64, SrmError> {
        let (granted, reservation) = {
            let mut state = self.inner.lock().await;
            let granted =
                job::extend_lifetime_millis(ctx, &mut *state, new_lifetime_millis).await?;
            let extends_reservation =
                state.payload.we_reserved_space && granted == new_lifetime_millis;
            let reservation = match &state.payload.space_token {
                Some(token) if extends_reservation => {
                    Some((state.payload.user.clone(), token.clone()))
                }
                _ => None,
            };
            (granted, reservation)
        };

        if let Some((user, token)) = reservation {
            let lifetime = Duration::from_millis(granted.max(0) as u64);
            if let Err(e) = call_storage(
                ctx,
                ctx.storage.extend_reservation_lifetime(&user, &token, lifetime),
            )
            .await
            {
                warn!(job_id = %self.id, token = %token, error = %e, "Failed to extend space reservation");
            }
        }
        Ok(granted)
    }

    /// Claim the SURL again after a restart.
    pub(crate) async fn reclaim_upload(&self, ctx: &SrmContext) {
        let state = self.inner.lock().await;
        if state.data.state.is_final() {
            return;
        }
        if let Err(holder) = ctx.uploads.register(&self.surl, self.id) {
            warn!(job_id = %self.id, holder = %holder, surl = %self.surl, "SURL claimed by another upload");
        }
    }
}

/// Put-done status for an upload that is not waiting for it.
async fn put_done_refused(
    ctx: &SrmContext,
    state: &mut PutFileState,
    current: State,
) -> ReturnStatus {
    match current {
        State::Done => {
            ReturnStatus::new(StatusCode::DuplicationError, "File exists already.".to_string())
        }
        State::Canceled => {
            ReturnStatus::new(StatusCode::Aborted, "The SURL has been aborted.".to_string())
        }
        State::Failed => ReturnStatus::new(
            state.data.status_code.unwrap_or(StatusCode::Failure),
            "Upload failed.".to_string(),
        ),
        _ => {
            if let Err(e) = job::set_state_and_status(
                ctx,
                state,
                State::Failed,
                "SrmPutDone called before TURL was made available.",
                StatusCode::InvalidPath,
            )
            .await
            {
                return ReturnStatus::new(StatusCode::Failure, e.to_string());
            }
            ReturnStatus::new(StatusCode::InvalidPath, "File does not exist.".to_string())
        }
    }
}

impl PutFileState {
    pub(crate) fn return_status(&self) -> ReturnStatus {
        let description = Some(self.data.latest_description());
        if let Some(code) = self.data.status_code {
            return match code {
                StatusCode::Success | StatusCode::SpaceAvailable => ReturnStatus::bare(code),
                _ => ReturnStatus::new(code, description),
            };
        }
        match self.data.state {
            State::Pending | State::RQueued | State::Restored => {
                ReturnStatus::new(StatusCode::RequestQueued, description)
            }
            State::Ready | State::Transferring => ReturnStatus::bare(StatusCode::SpaceAvailable),
            State::Done => ReturnStatus::success(),
            State::Canceled => ReturnStatus::new(StatusCode::Aborted, description),
            State::Failed => ReturnStatus::new(StatusCode::Failure, description),
            _ => ReturnStatus::new(StatusCode::RequestInProgress, description),
        }
    }

    /// Space token, if any.
    pub fn space_token(&self) -> Option<&str> {
        self.payload.space_token.as_deref()
    }

    pub fn we_reserved_space(&self) -> bool {
        self.payload.we_reserved_space
    }

    pub fn is_space_marked(&self) -> bool {
        self.payload.space_marked
    }

    pub fn file_id(&self) -> Option<&str> {
        self.payload.file_id.as_deref()
    }

    pub fn turl(&self) -> Option<&str> {
        self.payload.turl.as_deref()
    }

    /// Owned handles for a backend call made off the job's lock.
    fn call_parts(&self, ctx: &SrmContext) -> (Arc<dyn StorageBackend>, SrmUser, String) {
        (ctx.storage.clone(), self.payload.user.clone(), self.payload.surl.clone())
    }

    async fn compute_turl(&mut self, ctx: &SrmContext) -> Result<(), JobFailure> {
        let file_id = self.payload.file_id.clone().unwrap_or_default();
        let outcome = call_storage(
            ctx,
            ctx.storage.put_turl(
                &self.payload.user,
                &self.payload.surl,
                &file_id,
                &self.payload.protocols,
            ),
        )
        .await;
        match outcome {
            Ok(turl) => {
                debug!(job_id = %self.data.id, turl = %turl, "TURL computed");
                self.payload.turl = Some(turl);
                Ok(())
            }
            Err(StorageError::AuthorizationFailure(message)) => {
                error!(job_id = %self.data.id, error = %message, "Not authorized to upload");
                job::set_state_and_status(
                    ctx,
                    self,
                    State::Failed,
                    &message,
                    StatusCode::AuthorizationFailure,
                )
                .await?;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                let message = format!("cannot obtain turl for file: {}", e);
                error!(job_id = %self.data.id, error = %message, "TURL computation failed");
                job::set_state(ctx, self, State::Failed, &message, true).await?;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl JobBody for PutFileState {
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
        self.data.add_history_event("run method is executed");

        if self.payload.file_id.is_none() {
            if ctx.uploads.register(&self.payload.surl, job_id).is_err() {
                let status = if self.payload.overwrite {
                    StatusCode::FileBusy
                } else {
                    StatusCode::DuplicationError
                };
                job::set_state_and_status(
                    ctx,
                    self,
                    State::Failed,
                    "The requested SURL is locked by another upload.",
                    status,
                )
                .await?;
                return Ok(());
            }

            let supported = ctx.storage.supported_put_protocols();
            if self.payload.protocols.is_empty()
                || !protocols_supported(&self.payload.protocols, &supported)
            {
                return Err(JobFailure::fatal(
                    "transfer protocols not supported",
                    StatusCode::NotSupported,
                ));
            }

            job::set_state(ctx, self, State::AsyncWait, "Doing name space lookup.", false).await?;
            let (storage, user, surl) = self.call_parts(ctx);
            let size = self.payload.size;
            let overwrite = self.payload.overwrite;
            spawn_backend_call(
                ctx,
                job_id,
                async move { storage.prepare_to_put(&user, &surl, size, overwrite).await },
                Completion::PrepareToPut,
            );
            return Ok(());
        }

        if self.payload.space_token.is_none() && ctx.config.reserve_space_implicitly {
            job::set_state(ctx, self, State::AsyncWait, "Reserving space.", false).await?;
            let (storage, user, _) = self.call_parts(ctx);
            let size = self.payload.reservation_size();
            let lifetime = remaining_lease(&self.data);
            debug!(job_id = %job_id, size, "Reserving space implicitly");
            spawn_backend_call(
                ctx,
                job_id,
                async move { storage.reserve_space(&user, size, lifetime, None).await },
                Completion::ReserveSpace,
            );
            return Ok(());
        }

        if let Some(token) = self.payload.space_token.clone()
            && !self.payload.space_marked
        {
            job::set_state(ctx, self, State::AsyncWait, "Marking space as being used.", false)
                .await?;
            let (storage, user, surl) = self.call_parts(ctx);
            let size = self.payload.reservation_size();
            let lifetime = remaining_lease(&self.data);
            spawn_backend_call(
                ctx,
                job_id,
                async move {
                    storage
                        .mark_space_in_use(&user, &token, &surl, size, lifetime)
                        .await
                },
                Completion::UseSpace,
            );
            return Ok(());
        }

        if self.payload.turl.is_none() {
            self.compute_turl(ctx).await?;
        }
        Ok(())
    }

    fn state_changed(&mut self, ctx: &SrmContext, _old: State) {
        let state = self.data.state;
        notify_container(ctx, self.request_id, state);
        if !state.is_final() {
            return;
        }
        let job_id = self.data.id;
        let (storage, user, surl) = self.call_parts(ctx);

        if let Some(token) = self.payload.space_token.clone()
            && (self.payload.space_marked || self.payload.we_reserved_space)
        {
            let unmark = self.payload.space_marked;
            let release = self.payload.we_reserved_space;
            debug!(job_id = %job_id, token = %token, unmark, release, "Returning space");
            let storage = storage.clone();
            let user = user.clone();
            let surl = surl.clone();
            spawn_compensation(ctx, job_id, "return space", async move {
                let mut outcome = Ok(());
                if unmark {
                    outcome = storage.unmark_space_in_use(&user, &token, &surl).await;
                }
                if release {
                    let released = storage.release_space(&user, &token).await;
                    outcome = outcome.and(released);
                }
                outcome
            });
        }

        if matches!(state, State::Canceled | State::Failed)
            && let Some(file_id) = self.payload.file_id.clone()
        {
            let reason = self.data.latest_description();
            let surl = surl.clone();
            spawn_compensation(ctx, job_id, "abort upload", async move {
                storage.abort_put(&user, &file_id, &surl, &reason).await
            });
        }

        ctx.uploads.unregister(&surl, job_id);
    }

    async fn on_completion(
        &mut self,
        ctx: &SrmContext,
        completion: Completion,
    ) -> Result<bool, SrmError> {
        let waiting = self.data.state == State::AsyncWait;
        let outcome = match completion {
            Completion::PrepareToPut(Ok(upload)) => {
                if !waiting {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, file_id = %upload.file_id, "Upload created");
                self.payload.file_id = Some(upload.file_id);
                if self.payload.space_token.is_none() {
                    self.payload.space_token = upload.default_space_token;
                }
                Ok(())
            }
            Completion::ReserveSpace(Ok(reservation)) => {
                if !waiting {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, token = %reservation.token, "Space reserved");
                self.payload.we_reserved_space = true;
                self.payload.space_token = Some(reservation.token);
                Ok(())
            }
            Completion::UseSpace(Ok(())) => {
                if !waiting {
                    return Ok(false);
                }
                debug!(job_id = %self.data.id, "Space marked as being used");
                self.payload.space_marked = true;
                Ok(())
            }
            Completion::PrepareToPut(Err(e))
            | Completion::ReserveSpace(Err(e))
            | Completion::UseSpace(Err(e)) => Err(e),
            other => {
                warn!(job_id = %self.data.id, completion = other.name(), "Unexpected completion ignored");
                return Ok(false);
            }
        };

        match outcome {
            Ok(()) => {
                job::save_job(ctx, self, true).await;
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                self.pending_error = Some(e);
                Ok(waiting)
            }
            Err(e) => {
                warn!(job_id = %self.data.id, error = %e, "Upload preparation failed");
                let message = e.to_string();
                job::set_state_and_status(ctx, self, State::Failed, &message, e.status_code())
                    .await?;
                Ok(false)
            }
        }
    }
}
