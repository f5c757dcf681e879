// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asynchronous backend calls and their delivery back to jobs.
//!
//! A job that needs a resource spawns the backend call with
//! [`spawn_backend_call`] and leaves `run` in ASYNCWAIT. When the call
//! resolves (or times out) the outcome is wrapped in a [`Completion`] and
//! delivered to the job by id: the job is looked up in the registry, its lock
//! taken, the completion handled by the job's kind, the lock released, and
//! the job handed back to its scheduler if the handler asked for it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::SrmContext;
use crate::job::JobId;
use crate::storage::{FileMetadata, PinnedFile, PreparedUpload, Reservation, StorageError};

/// Outcome of an asynchronous backend call.
#[derive(Debug)]
pub enum Completion {
    FileInfo(Result<FileMetadata, StorageError>),
    Pin(Result<PinnedFile, StorageError>),
    PrepareToPut(Result<PreparedUpload, StorageError>),
    ReserveSpace(Result<Reservation, StorageError>),
    UseSpace(Result<(), StorageError>),
    Transfer(Result<(), StorageError>),
}

impl Completion {
    pub fn name(&self) -> &'static str {
        match self {
            Completion::FileInfo(_) => "file_info",
            Completion::Pin(_) => "pin",
            Completion::PrepareToPut(_) => "prepare_to_put",
            Completion::ReserveSpace(_) => "reserve_space",
            Completion::UseSpace(_) => "use_space",
            Completion::Transfer(_) => "transfer",
        }
    }
}

/// Run a backend call on its own task and deliver the outcome to `job_id`.
///
/// The call is bounded by the configured storage timeout; expiry is
/// delivered as [`StorageError::Timeout`].
pub fn spawn_backend_call<T, F, M>(
    ctx: &SrmContext,
    job_id: JobId,
    call: F,
    into_completion: M,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StorageError>> + Send + 'static,
    M: FnOnce(Result<T, StorageError>) -> Completion + Send + 'static,
{
    let timeout = ctx.config.storage_timeout;
    spawn_backend_call_within(ctx, job_id, timeout, call, into_completion)
}

/// [`spawn_backend_call`] with an explicit timeout, for long running calls
/// such as transfers.
pub fn spawn_backend_call_within<T, F, M>(
    ctx: &SrmContext,
    job_id: JobId,
    timeout: Duration,
    call: F,
    into_completion: M,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StorageError>> + Send + 'static,
    M: FnOnce(Result<T, StorageError>) -> Completion + Send + 'static,
{
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StorageError::Timeout),
        };
        deliver(&ctx, job_id, into_completion(outcome)).await;
    })
}

/// Deliver a completion to a live job.
///
/// Completions for unknown jobs or jobs already in a final state are
/// dropped.
pub async fn deliver(ctx: &SrmContext, job_id: JobId, completion: Completion) {
    let Some(job) = ctx.jobs.get(&job_id) else {
        warn!(job_id = %job_id, completion = completion.name(), "Completion for unknown job");
        return;
    };

    let reschedule = {
        let mut guard = job.lock().await;
        let state = guard.data().state();
        if state.is_final() {
            debug!(
                job_id = %job_id,
                state = %state,
                completion = completion.name(),
                "Completion for finished job ignored"
            );
            return;
        }
        match guard.body().on_completion(ctx, completion).await {
            Ok(reschedule) => reschedule,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to handle completion");
                false
            }
        }
    };

    if reschedule && let Err(e) = job.reschedule(ctx).await {
        warn!(job_id = %job_id, error = %e, "Failed to reschedule job after completion");
    }
}

/// Fire-and-forget compensating call (unpin, release, abort upload).
///
/// Failures are logged only; the job has already reached its final state.
pub fn spawn_compensation<F>(ctx: &SrmContext, job_id: JobId, operation: &'static str, call: F)
where
    F: Future<Output = Result<(), StorageError>> + Send + 'static,
{
    let timeout = ctx.config.storage_timeout;
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => debug!(job_id = %job_id, operation, "Compensation completed"),
            Ok(Err(e)) => {
                warn!(job_id = %job_id, operation, error = %e, "Compensation failed")
            }
            Err(_) => warn!(job_id = %job_id, operation, "Compensation timed out"),
        }
    });
}
