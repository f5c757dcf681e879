// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol-neutral request handlers.
//!
//! These are the operations a protocol layer exposes to clients: submit a
//! request, query its status, extend lifetimes, abort, release pins and
//! commit uploads. Every outcome, including failures, is reported as a
//! [`ReturnStatus`] inside the response.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::container::ContainerRequest;
use crate::context::SrmContext;
use crate::error::SrmError;
use crate::file_request::FileStatus;
use crate::job::{self, Job, JobId};
use crate::request::{NewFile, RequestData, RequestOptions, RequestType};
use crate::reserve_space::{ReserveSpaceRequest, ReserveSpaceStatus};
use crate::status::{RequestSummary, ReturnStatus, StatusCode};

/// Lifetime of a request when the client asks for none.
pub const DEFAULT_REQUEST_LIFETIME: Duration = Duration::from_secs(4 * 60 * 60);

/// Shared state for request handlers.
pub struct SrmHandlerState {
    pub ctx: SrmContext,
}

impl SrmHandlerState {
    pub fn new(ctx: SrmContext) -> Self {
        Self { ctx }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub request_type: RequestType,
    pub request: RequestData,
    #[serde(default)]
    pub options: RequestOptions,
    pub files: Vec<NewFile>,
    /// Desired request lifetime; [`DEFAULT_REQUEST_LIFETIME`] when absent.
    pub lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestStatusResponse {
    pub status: ReturnStatus,
    pub request_token: Option<String>,
    pub request_type: Option<RequestType>,
    pub file_statuses: Vec<FileStatus>,
    pub remaining_lifetime_secs: Option<i64>,
}

impl RequestStatusResponse {
    fn error(request_token: Option<String>, err: &SrmError) -> Self {
        Self {
            status: err.to_return_status(),
            request_token,
            request_type: None,
            file_statuses: Vec::new(),
            remaining_lifetime_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusQuery {
    pub request_token: String,
    /// Restrict the file statuses to these SURLs; all files when empty.
    #[serde(default)]
    pub surls: Vec<String>,
    /// Wait up to this long for a change while the request is in progress.
    pub wait: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryQuery {
    pub request_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub status: ReturnStatus,
    pub summaries: Vec<RequestSummary>,
}

/// Status of one SURL within a multi-file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurlStatus {
    pub surl: String,
    pub status: ReturnStatus,
    /// Granted lifetime, for lifetime extensions.
    pub lifetime_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesRequest {
    pub request_token: String,
    #[serde(default)]
    pub surls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendFileLifetimeRequest {
    pub request_token: String,
    pub surls: Vec<String>,
    pub new_lifetime: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesResponse {
    pub status: ReturnStatus,
    pub files: Vec<SurlStatus>,
}

impl FilesResponse {
    fn error(err: &SrmError) -> Self {
        Self {
            status: err.to_return_status(),
            files: Vec::new(),
        }
    }

    fn from_results(results: Vec<(String, ReturnStatus)>) -> Self {
        let files: Vec<SurlStatus> = results
            .into_iter()
            .map(|(surl, status)| SurlStatus {
                surl,
                status,
                lifetime_secs: None,
            })
            .collect();
        Self {
            status: summarize(&files),
            files,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub request_token: String,
    #[serde(default = "default_abort_reason")]
    pub reason: String,
}

fn default_abort_reason() -> String {
    "Request aborted by client".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSpaceSubmit {
    pub request: RequestData,
    pub size_in_bytes: u64,
    /// Lifetime of the reservation; the request's lifetime when absent.
    pub desired_lifetime: Option<Duration>,
    pub space_description: Option<String>,
    pub lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReserveSpaceResponse {
    pub status: ReturnStatus,
    pub reservation: Option<ReserveSpaceStatus>,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_token(token: &str) -> Result<JobId, SrmError> {
    JobId::from_str(token)
        .map_err(|_| SrmError::invalid_request(format!("invalid request token '{}'", token)))
}

fn to_lifetime(lifetime: Option<Duration>) -> Result<TimeDelta, SrmError> {
    let lifetime = lifetime.unwrap_or(DEFAULT_REQUEST_LIFETIME);
    if lifetime.is_zero() {
        return Err(SrmError::ValidationError {
            field: "lifetime".to_string(),
            message: "must be positive".to_string(),
        });
    }
    TimeDelta::from_std(lifetime).map_err(|e| SrmError::ValidationError {
        field: "lifetime".to_string(),
        message: e.to_string(),
    })
}

fn summarize(files: &[SurlStatus]) -> ReturnStatus {
    let has_failure = files.iter().any(|file| file.status.code != StatusCode::Success);
    let has_success = files.iter().any(|file| file.status.code == StatusCode::Success);
    ReturnStatus::summary(has_failure, has_success)
}

async fn container(ctx: &SrmContext, token: &str) -> Result<Arc<ContainerRequest>, SrmError> {
    let id = parse_token(token)?;
    match ctx.load_job(id).await? {
        Job::Container(container) => Ok(container),
        _ => Err(SrmError::WrongJobKind {
            job_id: id,
            expected: "container request".to_string(),
        }),
    }
}

/// Save a new container and its file requests before they are scheduled.
async fn save_new_container(ctx: &SrmContext, container: &ContainerRequest) {
    container.save(ctx).await;
    for file in container.file_requests() {
        let mut guard = file.lock().await;
        job::save_job(ctx, guard.body(), true).await;
    }
}

async fn remaining_lifetime_secs(job: &Job) -> i64 {
    job.lock().await.data().remaining_lifetime().num_seconds()
}

// ============================================================================
// Container requests
// ============================================================================

/// Create a bring-online, get, put or copy request and schedule its files.
///
/// The response carries the request token and the initial statuses.
#[instrument(skip(state, submit), fields(request_type = %submit.request_type, files = submit.files.len()))]
pub async fn submit_container_request(
    state: &SrmHandlerState,
    submit: SubmitRequest,
) -> RequestStatusResponse {
    let ctx = &state.ctx;
    if submit.files.is_empty() {
        let err = SrmError::invalid_request("no files in request");
        return RequestStatusResponse::error(None, &err);
    }
    let lifetime = match to_lifetime(submit.lifetime) {
        Ok(lifetime) => lifetime,
        Err(e) => return RequestStatusResponse::error(None, &e),
    };

    let container = match ContainerRequest::new(
        ctx,
        submit.request_type,
        submit.request,
        submit.options,
        &submit.files,
        lifetime,
    ) {
        Ok(container) => Arc::new(container),
        Err(e) => {
            warn!(error = %e, "Rejected request");
            return RequestStatusResponse::error(None, &e);
        }
    };
    let id = container.id();
    info!(request_id = %id, "Request submitted");

    save_new_container(ctx, &container).await;
    let job = Job::Container(container.clone());
    ctx.jobs.register(job.clone());
    if let Err(e) = job.schedule(ctx).await {
        warn!(request_id = %id, error = %e, "Failed to schedule request");
    }

    RequestStatusResponse {
        status: container.overall_status(ctx).await,
        request_token: Some(id.to_string()),
        request_type: Some(container.request_type()),
        file_statuses: container.file_statuses(ctx).await,
        remaining_lifetime_secs: Some(remaining_lifetime_secs(&job).await),
    }
}

/// Status of a request and of its files, optionally waiting for a change.
#[instrument(skip(state, query), fields(request_token = %query.request_token))]
pub async fn get_request_status(
    state: &SrmHandlerState,
    query: StatusQuery,
) -> RequestStatusResponse {
    let ctx = &state.ctx;
    let container = match container(ctx, &query.request_token).await {
        Ok(container) => container,
        Err(e) => return RequestStatusResponse::error(Some(query.request_token), &e),
    };

    let status = match query.wait {
        Some(wait) => container.wait_for_status(ctx, wait).await,
        None => container.overall_status(ctx).await,
    };
    let mut file_statuses = container.file_statuses(ctx).await;
    if !query.surls.is_empty() {
        file_statuses.retain(|file| query.surls.contains(&file.surl));
    }
    debug!(status = %status, "Request status");

    RequestStatusResponse {
        status,
        request_token: Some(query.request_token),
        request_type: Some(container.request_type()),
        file_statuses,
        remaining_lifetime_secs: Some(
            remaining_lifetime_secs(&Job::Container(container.clone())).await,
        ),
    }
}

/// Summaries of several requests. Unknown tokens get a summary carrying the
/// error and no files.
#[instrument(skip(state, query), fields(requests = query.request_tokens.len()))]
pub async fn get_request_summary(state: &SrmHandlerState, query: SummaryQuery) -> SummaryResponse {
    let ctx = &state.ctx;
    let mut summaries = Vec::with_capacity(query.request_tokens.len());
    let mut has_failure = false;
    let mut has_success = false;
    for token in query.request_tokens {
        match container(ctx, &token).await {
            Ok(container) => {
                has_success = true;
                summaries.push(container.request_summary(ctx).await);
            }
            Err(e) => {
                has_failure = true;
                summaries.push(RequestSummary {
                    request_token: token,
                    request_type: String::new(),
                    status: e.to_return_status(),
                    total_files: 0,
                    failed_files: 0,
                    completed_files: 0,
                    waiting_files: 0,
                });
            }
        }
    }
    SummaryResponse {
        status: ReturnStatus::summary(has_failure, has_success),
        summaries,
    }
}

/// Extend the lifetime of the given files, and their request with them.
#[instrument(skip(state, request), fields(request_token = %request.request_token))]
pub async fn extend_file_lifetime(
    state: &SrmHandlerState,
    request: ExtendFileLifetimeRequest,
) -> FilesResponse {
    let ctx = &state.ctx;
    let container = match container(ctx, &request.request_token).await {
        Ok(container) => container,
        Err(e) => return FilesResponse::error(&e),
    };
    let millis = i64::try_from(request.new_lifetime.as_millis()).unwrap_or(i64::MAX);

    let mut files = Vec::with_capacity(request.surls.len());
    for surl in request.surls {
        let (status, lifetime_secs) = match container.extend_file_lifetime(ctx, &surl, millis).await
        {
            Ok(granted) => (ReturnStatus::success(), Some(granted / 1_000)),
            Err(e) => (e.to_return_status(), None),
        };
        files.push(SurlStatus {
            surl,
            status,
            lifetime_secs,
        });
    }
    FilesResponse {
        status: summarize(&files),
        files,
    }
}

/// Abort a container request or a space reservation.
#[instrument(skip(state, request), fields(request_token = %request.request_token))]
pub async fn abort_request(state: &SrmHandlerState, request: AbortRequest) -> ReturnStatus {
    let ctx = &state.ctx;
    let id = match parse_token(&request.request_token) {
        Ok(id) => id,
        Err(e) => return e.to_return_status(),
    };
    match ctx.load_job(id).await {
        Ok(Job::Container(container)) => container.abort(ctx, &request.reason).await,
        Ok(Job::ReserveSpace(reservation)) => reservation.abort(ctx, &request.reason).await,
        Ok(Job::File(_)) => SrmError::WrongJobKind {
            job_id: id,
            expected: "request".to_string(),
        }
        .to_return_status(),
        Err(e) => e.to_return_status(),
    }
}

/// Abort individual files of a request.
#[instrument(skip(state, request), fields(request_token = %request.request_token))]
pub async fn abort_files(state: &SrmHandlerState, request: FilesRequest) -> FilesResponse {
    let ctx = &state.ctx;
    match container(ctx, &request.request_token).await {
        Ok(container) => FilesResponse::from_results(
            container
                .abort_files(ctx, &request.surls, "File request aborted by client")
                .await,
        ),
        Err(e) => FilesResponse::error(&e),
    }
}

/// Release the pins of a get or bring-online request.
#[instrument(skip(state, request), fields(request_token = %request.request_token))]
pub async fn release_files(state: &SrmHandlerState, request: FilesRequest) -> FilesResponse {
    let ctx = &state.ctx;
    let container = match container(ctx, &request.request_token).await {
        Ok(container) => container,
        Err(e) => return FilesResponse::error(&e),
    };
    match container.release_files(ctx, &request.surls).await {
        Ok(results) => FilesResponse::from_results(results),
        Err(e) => FilesResponse::error(&e),
    }
}

/// Commit uploads of a put request.
#[instrument(skip(state, request), fields(request_token = %request.request_token))]
pub async fn put_done(state: &SrmHandlerState, request: FilesRequest) -> FilesResponse {
    let ctx = &state.ctx;
    if request.surls.is_empty() {
        return FilesResponse::error(&SrmError::invalid_request("no SURLs given"));
    }
    let container = match container(ctx, &request.request_token).await {
        Ok(container) => container,
        Err(e) => return FilesResponse::error(&e),
    };
    match container.put_done(ctx, &request.surls).await {
        Ok(results) => FilesResponse::from_results(results),
        Err(e) => FilesResponse::error(&e),
    }
}

// ============================================================================
// Space reservations
// ============================================================================

/// Create a space reservation request and schedule it.
#[instrument(skip(state, submit), fields(size = submit.size_in_bytes))]
pub async fn submit_reserve_space(
    state: &SrmHandlerState,
    submit: ReserveSpaceSubmit,
) -> ReserveSpaceResponse {
    let ctx = &state.ctx;
    if submit.size_in_bytes == 0 {
        let err = SrmError::ValidationError {
            field: "size_in_bytes".to_string(),
            message: "must be positive".to_string(),
        };
        return ReserveSpaceResponse {
            status: err.to_return_status(),
            reservation: None,
        };
    }
    let lifetime = match to_lifetime(submit.lifetime) {
        Ok(lifetime) => lifetime,
        Err(e) => {
            return ReserveSpaceResponse {
                status: e.to_return_status(),
                reservation: None,
            };
        }
    };

    let reservation = Arc::new(ReserveSpaceRequest::new(
        submit.request,
        submit.size_in_bytes,
        submit.desired_lifetime,
        submit.space_description,
        lifetime,
        ctx.config.max_retries,
    ));
    info!(request_id = %reservation.id(), "Space reservation submitted");

    let job = Job::ReserveSpace(reservation.clone());
    {
        let mut guard = job.lock().await;
        job::save_job(ctx, guard.body(), true).await;
    }
    ctx.jobs.register(job.clone());
    if let Err(e) = job.schedule(ctx).await {
        warn!(request_id = %reservation.id(), error = %e, "Failed to schedule space reservation");
    }

    let status = reservation.status().await;
    ReserveSpaceResponse {
        status: status.status.clone(),
        reservation: Some(status),
    }
}

/// Status of a space reservation request.
#[instrument(skip(state))]
pub async fn get_reserve_space_status(
    state: &SrmHandlerState,
    request_token: &str,
) -> ReserveSpaceResponse {
    let ctx = &state.ctx;
    let reservation = match parse_token(request_token) {
        Ok(id) => match ctx.load_job(id).await {
            Ok(Job::ReserveSpace(reservation)) => Ok(reservation),
            Ok(_) => Err(SrmError::WrongJobKind {
                job_id: id,
                expected: "space reservation".to_string(),
            }),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    match reservation {
        Ok(reservation) => {
            let status = reservation.status().await;
            ReserveSpaceResponse {
                status: status.status.clone(),
                reservation: Some(status),
            }
        }
        Err(e) => ReserveSpaceResponse {
            status: e.to_return_status(),
            reservation: None,
        },
    }
}
