// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handle to a live job of any kind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use crate::container::{ContainerRequest, ContainerState};
use crate::context::SrmContext;
use crate::error::SrmError;
use crate::file_request::{
    BringOnlineFileState, CopyFileState, FileRequest, GetFileState, PutFileState,
};
use crate::persistence::JobRecord;
use crate::reserve_space::{ReserveSpaceRequest, ReserveSpaceState};

use super::{JobBody, JobData, JobId, JobKind, State, set_scheduler, set_state};

/// A live job. Cheap to clone; clones share the job.
#[derive(Clone, Debug)]
pub enum Job {
    File(FileRequest),
    Container(Arc<ContainerRequest>),
    ReserveSpace(Arc<ReserveSpaceRequest>),
}

/// The held lock of a job.
pub enum JobGuard<'a> {
    Get(MutexGuard<'a, GetFileState>),
    Put(MutexGuard<'a, PutFileState>),
    BringOnline(MutexGuard<'a, BringOnlineFileState>),
    Copy(MutexGuard<'a, CopyFileState>),
    Container(MutexGuard<'a, ContainerState>),
    ReserveSpace(MutexGuard<'a, ReserveSpaceState>),
}

impl JobGuard<'_> {
    pub fn body(&mut self) -> &mut dyn JobBody {
        match self {
            JobGuard::Get(state) => &mut **state,
            JobGuard::Put(state) => &mut **state,
            JobGuard::BringOnline(state) => &mut **state,
            JobGuard::Copy(state) => &mut **state,
            JobGuard::Container(state) => &mut **state,
            JobGuard::ReserveSpace(state) => &mut **state,
        }
    }

    pub fn data(&self) -> &JobData {
        match self {
            JobGuard::Get(state) => &state.data,
            JobGuard::Put(state) => &state.data,
            JobGuard::BringOnline(state) => &state.data,
            JobGuard::Copy(state) => &state.data,
            JobGuard::Container(state) => &state.data,
            JobGuard::ReserveSpace(state) => &state.data,
        }
    }
}

/// What a job needs after its state was recovered on restart.
enum RestartAction {
    Schedule,
    TryToReady,
    Keep,
}

impl Job {
    pub fn id(&self) -> JobId {
        match self {
            Job::File(file) => file.id(),
            Job::Container(container) => container.id(),
            Job::ReserveSpace(request) => request.id(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::File(file) => file.kind(),
            Job::Container(container) => container.kind(),
            Job::ReserveSpace(_) => JobKind::ReserveSpace,
        }
    }

    pub fn as_container(&self) -> Option<&Arc<ContainerRequest>> {
        match self {
            Job::Container(container) => Some(container),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRequest> {
        match self {
            Job::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn as_reserve_space(&self) -> Option<&Arc<ReserveSpaceRequest>> {
        match self {
            Job::ReserveSpace(request) => Some(request),
            _ => None,
        }
    }

    pub async fn lock(&self) -> JobGuard<'_> {
        match self {
            Job::File(file) => file.lock().await,
            Job::Container(container) => JobGuard::Container(container.inner.lock().await),
            Job::ReserveSpace(request) => JobGuard::ReserveSpace(request.inner.lock().await),
        }
    }

    /// [`Job::lock`], giving up after `timeout`.
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<JobGuard<'_>, SrmError> {
        tokio::time::timeout(timeout, self.lock())
            .await
            .map_err(|_| SrmError::LockTimeout { job_id: self.id() })
    }

    pub async fn state(&self) -> State {
        self.lock().await.data().state()
    }

    /// Initial scheduling of a new job.
    ///
    /// The job must be PENDING. It is assigned the scheduler for its kind,
    /// saved, and handed over. A container schedules its file requests
    /// instead; it is never run itself.
    pub async fn schedule(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        if let Job::Container(container) = self {
            return container.schedule_file_requests(ctx).await;
        }
        let scheduler = ctx.schedulers.for_kind(self.kind())?;
        {
            let mut guard = self.lock().await;
            let state = guard.data().state();
            if state != State::Pending {
                return Err(SrmError::SchedulingRejected {
                    job_id: self.id(),
                    reason: format!("job is {}, expected PENDING", state),
                });
            }
            set_scheduler(ctx, guard.body(), scheduler.id(), scheduler.timestamp()).await;
        }
        debug!(job_id = %self.id(), scheduler_id = %scheduler.id(), "Scheduling job");
        scheduler.schedule(self.clone()).await
    }

    /// Hand the job back to its scheduler, after a completion or a retry
    /// delay.
    ///
    /// A scheduler id that is not live in this process is replaced by the
    /// scheduler for the job's kind.
    pub async fn reschedule(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        let scheduler = {
            let mut guard = self.lock().await;
            if guard.data().state().is_final() {
                return Ok(());
            }
            let owner = guard
                .data()
                .scheduler_id()
                .and_then(|id| ctx.schedulers.get(id));
            match owner {
                Some(scheduler) => scheduler,
                None => {
                    let scheduler = ctx.schedulers.for_kind(self.kind())?;
                    set_scheduler(ctx, guard.body(), scheduler.id(), scheduler.timestamp()).await;
                    scheduler
                }
            }
        };
        scheduler.schedule(self.clone()).await
    }

    /// Reschedule the job if it is RESTORED.
    pub async fn schedule_if_restored(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        if self.state().await == State::Restored {
            self.reschedule(ctx).await
        } else {
            Ok(())
        }
    }

    /// Ask the scheduler to move an RQUEUED job to READY.
    pub async fn try_to_ready(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        if let Job::Container(container) = self {
            container.try_to_ready(ctx).await;
            return Ok(());
        }
        let scheduler_id = {
            let guard = self.lock().await;
            if guard.data().state() != State::RQueued {
                return Ok(());
            }
            guard.data().scheduler_id().map(str::to_string)
        };
        let scheduler = match scheduler_id.and_then(|id| ctx.schedulers.get(&id)) {
            Some(scheduler) => scheduler,
            None => ctx.schedulers.for_kind(self.kind())?,
        };
        scheduler.try_to_ready_job(self.clone()).await
    }

    /// Expire the job if its lifetime has passed.
    pub async fn check_expiration(&self, ctx: &SrmContext) {
        if let Job::Container(container) = self {
            container.check_expiration(ctx).await;
            return;
        }
        let mut guard = self.lock().await;
        super::check_expiration(ctx, guard.body()).await;
    }

    /// Resume a job loaded from persistence after a restart.
    ///
    /// Queued and running jobs go through RESTORED and are scheduled again;
    /// jobs waiting for a backend call or a retry are scheduled directly.
    /// READY and TRANSFERRING survive for downloads and uploads only, whose
    /// clients may still be using the TURL.
    pub async fn on_restart(&self, ctx: &SrmContext) -> Result<(), SrmError> {
        if let Job::Container(container) = self {
            container.update_status(ctx).await;
            return Ok(());
        }
        let scheduler = ctx.schedulers.for_kind(self.kind())?;
        let keeps_ready = matches!(self.kind(), JobKind::GetFile | JobKind::PutFile);

        let action = {
            let mut guard = self.lock().await;
            let state = guard.data().state();
            if state.is_final() {
                return Ok(());
            }
            set_scheduler(ctx, guard.body(), scheduler.id(), scheduler.timestamp()).await;
            match state {
                State::Pending | State::AsyncWait | State::RetryWait | State::Restored => {
                    RestartAction::Schedule
                }
                State::TQueued
                | State::PriorityTQueued
                | State::Running
                | State::RunningWithoutThread => {
                    set_state(
                        ctx,
                        guard.body(),
                        State::Restored,
                        "Rescheduled after SRM service restart",
                        true,
                    )
                    .await?;
                    RestartAction::Schedule
                }
                State::Ready | State::Transferring if keeps_ready => RestartAction::Keep,
                State::RQueued if keeps_ready => RestartAction::TryToReady,
                other => {
                    warn!(job_id = %self.id(), state = %other, "Invalid state after restart");
                    let description =
                        format!("Invalid state ({}) detected after SRM service restart", other);
                    set_state(ctx, guard.body(), State::Failed, &description, true).await?;
                    RestartAction::Keep
                }
            }
        };

        if let Job::File(FileRequest::Put(put)) = self {
            put.reclaim_upload(ctx).await;
        }

        match action {
            RestartAction::Schedule => {
                info!(job_id = %self.id(), scheduler_id = %scheduler.id(), "Rescheduling restored job");
                scheduler.schedule(self.clone()).await
            }
            RestartAction::TryToReady => scheduler.try_to_ready_job(self.clone()).await,
            RestartAction::Keep => Ok(()),
        }
    }

    /// Rebuild a job from its record. A container needs the records of its
    /// file requests.
    pub fn restore(record: &JobRecord, children: &[JobRecord]) -> Result<Job, SrmError> {
        let job = match record.kind {
            JobKind::GetRequest
            | JobKind::PutRequest
            | JobKind::BringOnlineRequest
            | JobKind::CopyRequest => {
                Job::Container(Arc::new(ContainerRequest::restore(record, children)?))
            }
            JobKind::GetFile | JobKind::PutFile | JobKind::BringOnlineFile | JobKind::CopyFile => {
                Job::File(FileRequest::restore(record)?)
            }
            JobKind::ReserveSpace => {
                Job::ReserveSpace(Arc::new(ReserveSpaceRequest::restore(record)?))
            }
        };
        Ok(job)
    }
}
