// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container requests: the client's request, owning one file request per
//! file.
//!
//! A container is never run. It stays PENDING while its file requests do
//! the work, and converges to DONE or FAILED lazily: every status query
//! first checks whether all children have finished.
//!
//! Children are read without holding the container's lock, and each child
//! lock is awaited for at most the configured status timeout. Children
//! report state changes through a lock-free change counter, which long
//! polling status queries wait on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::SpacePrecedence;
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::file_request::{
    BringOnlineFileRequest, CopyDirection, CopyFileRequest, FileRequest, FileStatus,
    GetFileRequest, PutFileRequest, notify_container,
};
use crate::job::{self, Job, JobBody, JobData, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::request::{NewFile, RequestData, RequestOptions, RequestType};
use crate::status::{RequestSummary, ReturnStatus, StatusCode};

const NO_FILES: &str = "Request state is unknown or no files in request!!!";

/// Persisted fields of a container request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPayload {
    pub request_type: RequestType,
    pub request: RequestData,
    pub options: RequestOptions,
}

/// A client request over a fixed list of files.
pub struct ContainerRequest {
    id: JobId,
    kind: JobKind,
    request_type: RequestType,
    request: RequestData,
    options: RequestOptions,
    files: Vec<FileRequest>,
    changes: watch::Sender<u64>,
    /// Suggested polling delay in seconds; zero until first asked.
    retry_delta: AtomicU64,
    pub(crate) inner: Mutex<ContainerState>,
}

/// Mutable part of a [`ContainerRequest`].
pub struct ContainerState {
    pub(crate) data: JobData,
    pub(crate) payload: ContainerPayload,
}

impl ContainerRequest {
    /// Build a request and one file request per entry of `files`.
    ///
    /// Copy directions are decided here from the storage's notion of local
    /// SURLs.
    pub fn new(
        ctx: &SrmContext,
        request_type: RequestType,
        request: RequestData,
        options: RequestOptions,
        files: &[NewFile],
        lifetime: TimeDelta,
    ) -> Result<Self, SrmError> {
        let max_retries = ctx.config.max_retries;
        let data = JobData::new(request_type.container_kind(), lifetime, max_retries);
        let id = data.id();
        let user = request.user.clone();

        let mut children = Vec::with_capacity(files.len());
        for file in files {
            if file.surl.is_empty() {
                return Err(SrmError::ValidationError {
                    field: "surl".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            let child = match request_type {
                RequestType::Get => FileRequest::Get(Arc::new(GetFileRequest::new(
                    id,
                    &file.surl,
                    user.clone(),
                    &options,
                    lifetime,
                    max_retries,
                ))),
                RequestType::Put => FileRequest::Put(Arc::new(PutFileRequest::new(
                    id,
                    &file.surl,
                    file.size,
                    user.clone(),
                    &options,
                    lifetime,
                    max_retries,
                ))),
                RequestType::BringOnline => {
                    FileRequest::BringOnline(Arc::new(BringOnlineFileRequest::new(
                        id,
                        &file.surl,
                        user.clone(),
                        &options,
                        lifetime,
                        max_retries,
                    )))
                }
                RequestType::Copy => {
                    let Some(destination) = file.destination.as_deref() else {
                        return Err(SrmError::ValidationError {
                            field: "destination".to_string(),
                            message: format!("copy of {} has no destination", file.surl),
                        });
                    };
                    let direction = CopyDirection::classify(&file.surl, destination, |surl| {
                        ctx.storage.is_local_surl(surl)
                    })?;
                    FileRequest::Copy(Arc::new(CopyFileRequest::new(
                        id,
                        file,
                        direction,
                        &request,
                        &options,
                        lifetime,
                        max_retries,
                    )?))
                }
            };
            children.push(child);
        }

        let payload = ContainerPayload {
            request_type,
            request: request.clone(),
            options: options.clone(),
        };
        Ok(Self::assemble(data, payload, children))
    }

    pub(crate) fn restore(record: &JobRecord, children: &[JobRecord]) -> Result<Self, SrmError> {
        let payload: ContainerPayload = serde_json::from_value(record.payload.clone())?;
        let expected = payload.request_type.file_kind();
        let files = children
            .iter()
            .map(|child| {
                if child.kind != expected {
                    return Err(SrmError::WrongJobKind {
                        job_id: child.id,
                        expected: expected.to_string(),
                    });
                }
                FileRequest::restore(child)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::assemble(JobData::from_record(record), payload, files))
    }

    fn assemble(data: JobData, payload: ContainerPayload, files: Vec<FileRequest>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            id: data.id(),
            kind: data.kind(),
            request_type: payload.request_type,
            request: payload.request.clone(),
            options: payload.options.clone(),
            files,
            changes,
            retry_delta: AtomicU64::new(0),
            inner: Mutex::new(ContainerState { data, payload }),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn request(&self) -> &RequestData {
        &self.request
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn file_requests(&self) -> &[FileRequest] {
        &self.files
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.data.state
    }

    /// The file request operating on `surl`, as source or destination.
    pub fn file_request_by_surl(&self, surl: &str) -> Option<&FileRequest> {
        self.files
            .iter()
            .find(|file| file.surl() == surl)
            .or_else(|| self.files.iter().find(|file| file.is_touching_surl(surl)))
    }

    // ========================================================================
    // Change notification and wait hints
    // ========================================================================

    /// Counter bumped whenever a child reaches a state a client cares about.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Lock free; called from child hooks with the child's lock held.
    pub fn file_request_state_changed(&self, new: State) {
        if matches!(
            new,
            State::RQueued | State::Ready | State::Done | State::Canceled | State::Failed
        ) {
            self.changes.send_modify(|counter| *counter += 1);
        }
    }

    pub fn reset_retry_delta(&self) {
        self.retry_delta.store(0, Ordering::Relaxed);
    }

    /// Suggested delay before the client polls again.
    ///
    /// Doubles on every call, starting at one second and capped at the
    /// configured maximum update period.
    pub fn estimated_wait(&self, ctx: &SrmContext) -> Duration {
        let max = ctx.config.max_update_period.as_secs().max(1);
        let previous = self
            .retry_delta
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |delta| {
                Some(if delta == 0 { 1 } else { (delta * 2).min(max) })
            })
            .unwrap_or(0);
        let current = if previous == 0 {
            1
        } else {
            (previous * 2).min(max)
        };
        Duration::from_secs(current)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Move the container to its final state once every child has finished.
    ///
    /// DONE if any child completed, FAILED otherwise. Children whose lock
    /// is not acquired within the status timeout leave the container as it
    /// is.
    pub async fn update_status(&self, ctx: &SrmContext) {
        let timeout = ctx.config.status_lock_timeout;
        let mut done = 0usize;
        for file in &self.files {
            let state = match tokio::time::timeout(timeout, file.state()).await {
                Ok(state) => state,
                Err(_) => {
                    debug!(request_id = %self.id, file_request_id = %file.id(), "Child busy, status not updated");
                    return;
                }
            };
            if !state.is_final() {
                return;
            }
            if state == State::Done {
                done += 1;
            }
        }

        let mut state = self.inner.lock().await;
        if state.data.state.is_final() {
            return;
        }
        let (target, description) = if self.files.is_empty() {
            error!(request_id = %self.id, "{}", NO_FILES);
            (State::Failed, NO_FILES)
        } else if done == self.files.len() {
            (State::Done, "All file requests succeeded.")
        } else if done > 0 {
            (State::Done, "File requests completed, some have failed.")
        } else {
            (State::Failed, "File requests have failed.")
        };
        if let Err(e) = job::set_state(ctx, &mut *state, target, description, true).await {
            error!(request_id = %self.id, error = %e, "Failed to finish container request");
        }
    }

    /// Aggregate status of the request.
    pub async fn overall_status(&self, ctx: &SrmContext) -> ReturnStatus {
        self.update_status(ctx).await;
        let description = {
            let state = self.inner.lock().await;
            let description = state.data.latest_description();
            if let Some(code) = state.data.status_code {
                return ReturnStatus::new(code, description);
            }
            description
        };
        if self.files.is_empty() {
            return ReturnStatus::new(StatusCode::InternalError, NO_FILES.to_string());
        }
        let codes = self.child_codes(ctx).await;
        aggregate_status(&codes, ctx.config.space_precedence, &description)
    }

    async fn child_codes(&self, ctx: &SrmContext) -> Vec<Option<StatusCode>> {
        let timeout = ctx.config.status_lock_timeout;
        let mut codes = Vec::with_capacity(self.files.len());
        for file in &self.files {
            match file.return_status_within(timeout).await {
                Ok(status) => codes.push(Some(status.code)),
                Err(e) => {
                    warn!(request_id = %self.id, file_request_id = %file.id(), error = %e, "Child status unavailable");
                    codes.push(None);
                }
            }
        }
        codes
    }

    /// Overall status plus per-file counts.
    pub async fn request_summary(&self, ctx: &SrmContext) -> RequestSummary {
        let status = self.overall_status(ctx).await;
        let codes = self.child_codes(ctx).await;
        let mut summary = RequestSummary {
            request_token: self.id.to_string(),
            request_type: self.request_type.to_string(),
            status,
            total_files: self.files.len(),
            failed_files: 0,
            completed_files: 0,
            waiting_files: 0,
        };
        for code in codes {
            match code {
                Some(StatusCode::RequestQueued) => summary.waiting_files += 1,
                Some(StatusCode::Success | StatusCode::Released) => summary.completed_files += 1,
                Some(code) if code.is_failure() => summary.failed_files += 1,
                Some(_) => {}
                None => summary.failed_files += 1,
            }
        }
        summary
    }

    /// Client facing status of every file, in request order.
    pub async fn file_statuses(&self, ctx: &SrmContext) -> Vec<FileStatus> {
        let mut statuses = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let mut status = file.file_status().await;
            if !status.state.is_final() {
                status.estimated_wait_secs = Some(self.estimated_wait(ctx).as_secs());
            }
            statuses.push(status);
        }
        statuses
    }

    /// Overall status, waiting up to `timeout` for a change while the
    /// request is still being processed.
    pub async fn wait_for_status(&self, ctx: &SrmContext, timeout: Duration) -> ReturnStatus {
        let mut changes = self.subscribe();
        let status = self.overall_status(ctx).await;
        if !status.code.is_processing() || timeout.is_zero() {
            return status;
        }
        if tokio::time::timeout(timeout, changes.changed()).await.is_ok() {
            debug!(request_id = %self.id, "Request changed while waiting");
        }
        self.overall_status(ctx).await
    }

    // ========================================================================
    // Operations over the children
    // ========================================================================

    /// Schedule every file request. A child that cannot be scheduled fails
    /// alone.
    pub async fn schedule_file_requests(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        for file in &self.files {
            let job = Job::File(file.clone());
            // Job::schedule dispatches back here for containers.
            if let Err(e) = Box::pin(job.schedule(ctx)).await {
                warn!(request_id = %self.id, file_request_id = %file.id(), error = %e, "Failed to schedule file request");
                let mut guard = file.lock().await;
                if !guard.data().state().is_final()
                    && let Err(err) = job::set_state_and_status(
                        ctx,
                        guard.body(),
                        State::Failed,
                        &e.to_string(),
                        e.status_code(),
                    )
                    .await
                {
                    error!(file_request_id = %file.id(), error = %err, "Failed to fail unschedulable file request");
                }
            }
        }
        Ok(())
    }

    /// Offer every RQUEUED child a ready slot.
    pub async fn try_to_ready(&self, ctx: &SrmContext) {
        for file in &self.files {
            let job = Job::File(file.clone());
            if let Err(e) = Box::pin(job.try_to_ready(ctx)).await {
                debug!(file_request_id = %file.id(), error = %e, "File request not made ready");
            }
        }
    }

    /// Abort every unfinished file request.
    ///
    /// Returns a summary over the children: partial success when some
    /// could not be aborted.
    pub async fn abort(&self, ctx: &SrmContext, reason: &str) -> ReturnStatus {
        self.update_status(ctx).await;
        if self.state().await.is_final() {
            return ReturnStatus::success();
        }
        info!(request_id = %self.id, reason, "Aborting request");
        let mut has_failure = false;
        let mut has_success = false;
        for file in &self.files {
            match file.abort(ctx, reason).await {
                Ok(()) => has_success = true,
                Err(e) => {
                    warn!(file_request_id = %file.id(), error = %e, "Failed to abort file request");
                    has_failure = true;
                }
            }
        }
        self.update_status(ctx).await;
        ReturnStatus::summary(has_failure, has_success)
    }

    /// Abort the file requests for `surls`.
    pub async fn abort_files(
        &self,
        ctx: &SrmContext,
        surls: &[String],
        reason: &str,
    ) -> Vec<(String, ReturnStatus)> {
        let mut results = Vec::with_capacity(surls.len());
        for surl in surls {
            let status = match self.file_request_by_surl(surl) {
                Some(file) => match file.abort(ctx, reason).await {
                    Ok(()) => ReturnStatus::success(),
                    Err(e) => e.to_return_status(),
                },
                None => unknown_surl(),
            };
            results.push((surl.clone(), status));
        }
        self.update_status(ctx).await;
        results
    }

    /// Release the pins of the file requests for `surls`, or of every file
    /// request when `surls` is empty.
    pub async fn release_files(
        &self,
        ctx: &SrmContext,
        surls: &[String],
    ) -> Result<Vec<(String, ReturnStatus)>, SrmError> {
        if !matches!(self.request_type, RequestType::Get | RequestType::BringOnline) {
            return Err(SrmError::NotSupported {
                message: format!("{} requests hold no pins", self.request_type),
            });
        }
        let mut results = Vec::new();
        if surls.is_empty() {
            for file in &self.files {
                results.push((file.surl().to_string(), file.release(ctx).await));
            }
        } else {
            for surl in surls {
                let status = match self.file_request_by_surl(surl) {
                    Some(file) => file.release(ctx).await,
                    None => unknown_surl(),
                };
                results.push((surl.clone(), status));
            }
        }
        self.update_status(ctx).await;
        Ok(results)
    }

    /// Commit the uploads for `surls`.
    pub async fn put_done(
        &self,
        ctx: &SrmContext,
        surls: &[String],
    ) -> Result<Vec<(String, ReturnStatus)>, SrmError> {
        if self.request_type != RequestType::Put {
            return Err(SrmError::NotSupported {
                message: format!("put-done on a {} request", self.request_type),
            });
        }
        let mut results = Vec::with_capacity(surls.len());
        for surl in surls {
            let status = match self.file_request_by_surl(surl) {
                Some(FileRequest::Put(put)) => put.done(ctx).await,
                _ => unknown_surl(),
            };
            results.push((surl.clone(), status));
        }
        self.update_status(ctx).await;
        Ok(results)
    }

    /// Extend the lifetime of the file request for `surl`.
    pub async fn extend_file_lifetime(
        &self,
        ctx: &SrmContext,
        surl: &str,
        new_lifetime_millis: i64,
    ) -> Result<i64, SrmError> {
        let file = self
            .file_request_by_surl(surl)
            .ok_or_else(|| SrmError::InvalidPath {
                path: surl.to_string(),
                message: "not part of this request".to_string(),
            })?;
        file.extend_lifetime(ctx, new_lifetime_millis).await
    }

    /// Extend the container's own lifetime.
    pub async fn extend_lifetime_millis(
        &self,
        ctx: &SrmContext,
        new_lifetime_millis: i64,
    ) -> Result<i64, SrmError> {
        let mut state = self.inner.lock().await;
        job::extend_lifetime_millis(ctx, &mut *state, new_lifetime_millis).await
    }

    /// Converge, then expire the container itself.
    pub async fn check_expiration(&self, ctx: &SrmContext) {
        self.update_status(ctx).await;
        let mut state = self.inner.lock().await;
        job::check_expiration(ctx, &mut *state).await;
    }

    /// Persist the container, unconditionally.
    pub async fn save(&self, ctx: &SrmContext) {
        let mut state = self.inner.lock().await;
        job::save_job(ctx, &mut *state, true).await;
    }
}

impl std::fmt::Debug for ContainerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRequest")
            .field("id", &self.id)
            .field("request_type", &self.request_type)
            .field("files", &self.files.len())
            .finish()
    }
}

fn unknown_surl() -> ReturnStatus {
    ReturnStatus::new(
        StatusCode::InvalidPath,
        "SURL does not refer to an existing known file request".to_string(),
    )
}

#[async_trait::async_trait]
impl JobBody for ContainerState {
    fn data(&self) -> &JobData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut JobData {
        &mut self.data
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or_default()
    }

    async fn run(&mut self, _ctx: &SrmContext) -> Result<(), JobFailure> {
        Err(JobFailure::fatal(
            "container requests are not executed",
            StatusCode::InternalError,
        ))
    }

    fn state_changed(&mut self, ctx: &SrmContext, _old: State) {
        // Wakes long polling status queries.
        notify_container(ctx, self.data.id, self.data.state);
    }
}

/// Aggregate child status codes into the status of their request.
///
/// `None` is a child whose status could not be evaluated; it counts as
/// failed. `description` explains the non-success outcomes.
pub fn aggregate_status(
    codes: &[Option<StatusCode>],
    precedence: SpacePrecedence,
    description: &str,
) -> ReturnStatus {
    let total = codes.len();
    let mut queued = 0;
    let mut running = 0;
    let mut ready = 0;
    let mut done = 0;
    let mut aborted = 0;
    // Failures other than aborts and space outcomes.
    let mut failed = 0;
    let mut unevaluated = 0;
    let mut no_free_space = 0;
    let mut space_expired = 0;

    for code in codes {
        match code {
            Some(StatusCode::RequestQueued) => queued += 1,
            Some(StatusCode::RequestInProgress) => running += 1,
            Some(StatusCode::FilePinned | StatusCode::SpaceAvailable) => ready += 1,
            Some(StatusCode::Success | StatusCode::Released) => done += 1,
            Some(StatusCode::Aborted) => aborted += 1,
            Some(StatusCode::NoFreeSpace) => no_free_space += 1,
            Some(StatusCode::SpaceLifetimeExpired) => space_expired += 1,
            Some(code) if code.is_failure() => failed += 1,
            Some(code) => warn!(code = %code, "Unexpected file request status"),
            None => unevaluated += 1,
        }
    }
    let any_failure = aborted + failed + unevaluated + no_free_space + space_expired > 0;

    let with_description = |code| ReturnStatus::new(code, description.to_string());

    if aborted == total {
        return with_description(StatusCode::Aborted);
    }
    if failed == total || unevaluated == total {
        return with_description(StatusCode::Failure);
    }
    if ready + done == total {
        return if any_failure {
            ReturnStatus::bare(StatusCode::PartialSuccess)
        } else {
            ReturnStatus::success()
        };
    }
    if queued == total {
        return with_description(StatusCode::RequestQueued);
    }
    let space_order = match precedence {
        SpacePrecedence::NoFreeSpace => [
            (no_free_space, StatusCode::NoFreeSpace),
            (space_expired, StatusCode::SpaceLifetimeExpired),
        ],
        SpacePrecedence::SpaceLifetimeExpired => [
            (space_expired, StatusCode::SpaceLifetimeExpired),
            (no_free_space, StatusCode::NoFreeSpace),
        ],
    };
    for (count, code) in space_order {
        if count > 0 {
            return with_description(code);
        }
    }
    if running > 0 || queued > 0 {
        return with_description(StatusCode::RequestInProgress);
    }
    if ready > 0 || done > 0 {
        ReturnStatus::bare(StatusCode::PartialSuccess)
    } else {
        with_description(StatusCode::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::status::StatusCode::*;

    fn aggregate(codes: &[Option<StatusCode>]) -> StatusCode {
        aggregate_status(codes, SpacePrecedence::NoFreeSpace, "latest").code
    }

    #[test]
    fn test_all_aborted_is_aborted() {
        assert_eq!(aggregate(&[Some(Aborted), Some(Aborted)]), Aborted);
    }

    #[test]
    fn test_all_failed_is_failure() {
        assert_eq!(aggregate(&[Some(Failure), Some(Aborted)]), Failure);
        assert_eq!(aggregate(&[Some(InvalidPath), None]), Failure);
    }

    #[test]
    fn test_ready_and_done_is_success_without_explanation() {
        let status = aggregate_status(
            &[Some(FilePinned), Some(Released), Some(Success)],
            SpacePrecedence::NoFreeSpace,
            "latest",
        );
        assert_eq!(status, ReturnStatus::success());
    }

    #[test]
    fn test_all_queued_is_queued() {
        let status = aggregate_status(
            &[Some(RequestQueued), Some(RequestQueued)],
            SpacePrecedence::NoFreeSpace,
            "Request enqueued.",
        );
        assert_eq!(status.code, RequestQueued);
        assert_eq!(status.explanation.as_deref(), Some("Request enqueued."));
    }

    #[test]
    fn test_space_failures_win_over_progress() {
        let codes = [
            Some(RequestInProgress),
            Some(NoFreeSpace),
            Some(SpaceLifetimeExpired),
        ];
        assert_eq!(
            aggregate_status(&codes, SpacePrecedence::NoFreeSpace, "").code,
            NoFreeSpace
        );
        assert_eq!(
            aggregate_status(&codes, SpacePrecedence::SpaceLifetimeExpired, "").code,
            SpaceLifetimeExpired
        );
        assert_eq!(
            aggregate(&[Some(SpaceLifetimeExpired), Some(FilePinned)]),
            SpaceLifetimeExpired
        );
    }

    #[test]
    fn test_space_failures_are_not_generic_failures() {
        assert_eq!(aggregate(&[Some(NoFreeSpace)]), NoFreeSpace);
        assert_eq!(aggregate(&[Some(Aborted), Some(NoFreeSpace)]), NoFreeSpace);
        assert_eq!(
            aggregate(&[Some(SpaceLifetimeExpired), Some(Failure)]),
            SpaceLifetimeExpired
        );
        assert_eq!(aggregate(&[None, None]), Failure);
    }

    #[test]
    fn test_running_is_in_progress() {
        assert_eq!(aggregate(&[Some(RequestInProgress), Some(Failure)]), RequestInProgress);
        assert_eq!(aggregate(&[Some(RequestQueued), Some(FilePinned)]), RequestInProgress);
    }

    #[test]
    fn test_mixed_terminal_is_partial_success() {
        let status = aggregate_status(
            &[Some(Success), Some(Failure)],
            SpacePrecedence::NoFreeSpace,
            "latest",
        );
        assert_eq!(status, ReturnStatus::bare(PartialSuccess));
        assert_eq!(aggregate(&[Some(Released), Some(Aborted)]), PartialSuccess);
    }
}
