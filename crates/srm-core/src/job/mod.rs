// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs: the unit of work tracked by the engine.
//!
//! Every request and file request is a job. A job's mutable fields live in a
//! [`JobData`] owned by the job's state struct, which sits behind the job's
//! single `tokio::sync::Mutex`. Kind-specific behaviour is supplied through
//! the [`JobBody`] trait; the generic lifecycle operations in this module
//! ([`set_state`], [`save_job`], [`extend_lifetime_millis`],
//! [`check_expiration`]) work on any `&mut dyn JobBody` and are always called
//! with the job's lock held.

pub mod handle;
pub mod state;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::callbacks::Completion;
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::persistence::JobRecord;
use crate::status::StatusCode;

pub use handle::{Job, JobGuard};
pub use state::State;

// ============================================================================
// Identity
// ============================================================================

/// Unique, immutable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Concrete kind of a job. Schedulers are assigned per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    GetRequest,
    PutRequest,
    BringOnlineRequest,
    CopyRequest,
    GetFile,
    PutFile,
    BringOnlineFile,
    CopyFile,
    ReserveSpace,
}

impl JobKind {
    pub const ALL: [JobKind; 9] = [
        JobKind::GetRequest,
        JobKind::PutRequest,
        JobKind::BringOnlineRequest,
        JobKind::CopyRequest,
        JobKind::GetFile,
        JobKind::PutFile,
        JobKind::BringOnlineFile,
        JobKind::CopyFile,
        JobKind::ReserveSpace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::GetRequest => "get_request",
            JobKind::PutRequest => "put_request",
            JobKind::BringOnlineRequest => "bring_online_request",
            JobKind::CopyRequest => "copy_request",
            JobKind::GetFile => "get_file",
            JobKind::PutFile => "put_file",
            JobKind::BringOnlineFile => "bring_online_file",
            JobKind::CopyFile => "copy_file",
            JobKind::ReserveSpace => "reserve_space",
        }
    }

    /// Container requests own file requests and are never run themselves.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            JobKind::GetRequest
                | JobKind::PutRequest
                | JobKind::BringOnlineRequest
                | JobKind::CopyRequest
        )
    }

    pub fn is_file_request(&self) -> bool {
        matches!(
            self,
            JobKind::GetFile | JobKind::PutFile | JobKind::BringOnlineFile | JobKind::CopyFile
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = SrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SrmError::ValidationError {
                field: "kind".to_string(),
                message: format!("unknown job kind '{}'", s),
            })
    }
}

// ============================================================================
// Job data
// ============================================================================

/// One entry of a job's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Monotonic per-job sequence number.
    pub id: u64,
    /// State the job was in when the event was recorded.
    pub state: State,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Fields shared by every job kind.
#[derive(Debug, Clone)]
pub struct JobData {
    pub(crate) id: JobId,
    pub(crate) kind: JobKind,
    pub(crate) creation_time: DateTime<Utc>,
    pub(crate) state: State,
    pub(crate) lifetime: TimeDelta,
    pub(crate) scheduler_id: Option<String>,
    pub(crate) scheduler_timestamp: i64,
    pub(crate) priority: u32,
    pub(crate) retries: u32,
    pub(crate) max_retries: u32,
    pub(crate) history: Vec<HistoryEvent>,
    pub(crate) next_history_id: u64,
    pub(crate) error_message: String,
    pub(crate) last_state_transition_time: DateTime<Utc>,
    pub(crate) status_code: Option<StatusCode>,
    pub(crate) saved_in_final_state: bool,
}

impl JobData {
    /// A new PENDING job created now.
    pub fn new(kind: JobKind, lifetime: TimeDelta, max_retries: u32) -> Self {
        let now = Utc::now();
        let mut data = Self {
            id: JobId::new(),
            kind,
            creation_time: now,
            state: State::Pending,
            lifetime,
            scheduler_id: None,
            scheduler_timestamp: 0,
            priority: 0,
            retries: 0,
            max_retries,
            history: Vec::new(),
            next_history_id: 0,
            error_message: String::new(),
            last_state_transition_time: now,
            status_code: None,
            saved_in_final_state: false,
        };
        data.push_history(State::Pending, "Request created", now);
        data
    }

    /// Rebuild job data from a persisted record.
    pub fn from_record(record: &JobRecord) -> Self {
        let next_history_id = record
            .history
            .iter()
            .map(|event| event.id + 1)
            .max()
            .unwrap_or(0);
        Self {
            id: record.id,
            kind: record.kind,
            creation_time: record.creation_time,
            state: record.state,
            lifetime: TimeDelta::milliseconds(record.lifetime_millis),
            scheduler_id: record.scheduler_id.clone(),
            scheduler_timestamp: record.scheduler_timestamp,
            priority: record.priority,
            retries: record.retries,
            max_retries: record.max_retries,
            history: record.history.clone(),
            next_history_id,
            error_message: record.error_message.clone(),
            last_state_transition_time: record.last_state_transition_time,
            status_code: record.status_code,
            saved_in_final_state: record.state.is_final(),
        }
    }

    /// Snapshot of the job as a persistence record.
    pub fn to_record(&self, parent_id: Option<JobId>, payload: serde_json::Value) -> JobRecord {
        JobRecord {
            id: self.id,
            kind: self.kind,
            parent_id,
            state: self.state,
            creation_time: self.creation_time,
            lifetime_millis: self.lifetime.num_milliseconds(),
            scheduler_id: self.scheduler_id.clone(),
            scheduler_timestamp: self.scheduler_timestamp,
            priority: self.priority,
            retries: self.retries,
            max_retries: self.max_retries,
            last_state_transition_time: self.last_state_transition_time,
            status_code: self.status_code,
            error_message: self.error_message.clone(),
            payload,
            history: self.history.clone(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn lifetime(&self) -> TimeDelta {
        self.lifetime
    }

    pub fn scheduler_id(&self) -> Option<&str> {
        self.scheduler_id.as_deref()
    }

    pub fn scheduler_timestamp(&self) -> i64 {
        self.scheduler_timestamp
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status_code
    }

    pub fn last_state_transition_time(&self) -> DateTime<Utc> {
        self.last_state_transition_time
    }

    /// Cumulative description of every state change.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    pub fn latest_history_event(&self) -> Option<&HistoryEvent> {
        self.history.last()
    }

    /// Description of the most recent history event, empty if none.
    pub fn latest_description(&self) -> String {
        self.latest_history_event()
            .map(|event| event.description.clone())
            .unwrap_or_default()
    }

    /// Human readable history, one event per line.
    pub fn history_string(&self) -> String {
        self.history
            .iter()
            .map(|event| {
                format!(
                    " at {} state {} : {}\n",
                    event.timestamp.to_rfc3339(),
                    event.state,
                    event.description
                )
            })
            .collect()
    }

    /// Record an event without changing state.
    pub fn add_history_event(&mut self, description: &str) {
        let state = self.state;
        self.push_history(state, description, Utc::now());
    }

    fn push_history(&mut self, state: State, description: &str, timestamp: DateTime<Utc>) {
        self.history.push(HistoryEvent {
            id: self.next_history_id,
            state,
            description: description.to_string(),
            timestamp,
        });
        self.next_history_id += 1;
    }

    /// Lifetime left at `now`; zero once final or expired.
    pub fn remaining_lifetime_at(&self, now: DateTime<Utc>) -> TimeDelta {
        if self.state.is_final() {
            return TimeDelta::zero();
        }
        let remaining = self.creation_time + self.lifetime - now;
        remaining.max(TimeDelta::zero())
    }

    pub fn remaining_lifetime(&self) -> TimeDelta {
        self.remaining_lifetime_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.creation_time + self.lifetime < now
    }

    /// Validate and apply a state change to the data alone.
    ///
    /// Returns the previous state, or `None` when `new` equals the current
    /// state. Nothing is modified when an error is returned.
    pub fn apply_transition(
        &mut self,
        new: State,
        description: &str,
    ) -> Result<Option<State>, SrmError> {
        let old = self.state;
        if old == new {
            return Ok(None);
        }
        if !old.can_transition_to(new) {
            return Err(SrmError::IllegalStateTransition {
                job_id: self.id,
                from: old,
                to: new,
            });
        }
        if !new.is_final() && self.scheduler_id.is_none() {
            return Err(SrmError::JobNotScheduled {
                job_id: self.id,
                to: new,
            });
        }

        let now = Utc::now();
        self.state = new;
        self.last_state_transition_time = now;
        self.push_history(new, description, now);

        if self.error_message.is_empty() {
            self.error_message.push_str(description);
        } else {
            self.error_message.push_str("\nat ");
            self.error_message.push_str(&now.to_rfc2822());
            self.error_message.push_str(" appended:\n");
            self.error_message.push_str(description);
        }

        if new == State::RetryWait {
            self.retries += 1;
        }

        Ok(Some(old))
    }
}

// ============================================================================
// Kind-specific behaviour
// ============================================================================

/// Kind-specific part of a job, implemented by each locked job state.
#[async_trait::async_trait]
pub trait JobBody: Send {
    fn data(&self) -> &JobData;

    fn data_mut(&mut self) -> &mut JobData;

    /// Owning container request, for file requests.
    fn parent_id(&self) -> Option<JobId> {
        None
    }

    /// Kind-specific fields as stored in the persistence record.
    fn payload(&self) -> serde_json::Value;

    /// Execute one step of the job. Invoked by the scheduler with the job in
    /// RUNNING.
    async fn run(&mut self, ctx: &SrmContext) -> Result<(), JobFailure>;

    /// Hook invoked after every committed state change, lock held.
    ///
    /// Must not block; compensating backend calls are spawned.
    fn state_changed(&mut self, _ctx: &SrmContext, _old: State) {}

    /// Handle the outcome of an asynchronous backend call.
    ///
    /// Returns `true` when the job should be handed back to its scheduler
    /// once the lock is released.
    async fn on_completion(
        &mut self,
        _ctx: &SrmContext,
        completion: Completion,
    ) -> Result<bool, SrmError> {
        warn!(
            job_id = %self.data().id,
            completion = completion.name(),
            "Unexpected completion ignored"
        );
        Ok(false)
    }

    fn record(&self) -> JobRecord {
        self.data().to_record(self.parent_id(), self.payload())
    }
}

// ============================================================================
// Generic lifecycle operations
// ============================================================================

/// Change the job's state, committing every side effect of the change.
///
/// A no-op when the state is unchanged. On success the history, error
/// message and retry counter are updated, the scheduler is notified, the
/// kind hook runs, and the job is saved when `save` is set or the job just
/// became final.
pub async fn set_state(
    ctx: &SrmContext,
    job: &mut dyn JobBody,
    new: State,
    description: &str,
    save: bool,
) -> Result<(), SrmError> {
    let Some(old) = job.data_mut().apply_transition(new, description)? else {
        return Ok(());
    };
    let job_id = job.data().id;
    debug!(job_id = %job_id, from = %old, to = %new, description, "State changed");

    if let Some(scheduler_id) = job.data().scheduler_id.clone() {
        match ctx.schedulers.get(&scheduler_id) {
            Some(scheduler) => scheduler.state_changed(job_id, old, new),
            None => debug!(
                job_id = %job_id,
                scheduler_id = %scheduler_id,
                "Scheduler not running in this process"
            ),
        }
    }
    if new.is_final() {
        job.data_mut().scheduler_id = None;
    }

    job.state_changed(ctx, old);

    // READY and TRANSFERRING jobs are kept across a restart, so these
    // transitions are written even with history logging disabled.
    let recoverable = matches!(new, State::Ready | State::Transferring);
    if save || recoverable || (!old.is_final() && new.is_final()) {
        save_job(ctx, job, recoverable).await;
    }
    Ok(())
}

/// [`set_state`], also storing the status code reported for the job.
pub async fn set_state_and_status(
    ctx: &SrmContext,
    job: &mut dyn JobBody,
    new: State,
    description: &str,
    status: StatusCode,
) -> Result<(), SrmError> {
    let previous = job.data_mut().status_code.replace(status);
    let result = set_state(ctx, job, new, description, true).await;
    if result.is_err() {
        job.data_mut().status_code = previous;
    }
    result
}

/// Persist the job. A job in a final state is written at most once.
///
/// Errors are logged, never returned.
pub async fn save_job(ctx: &SrmContext, job: &mut dyn JobBody, force: bool) {
    if job.data().saved_in_final_state {
        return;
    }
    let is_final = job.data().state.is_final();
    let record = job.record();
    match ctx.persistence.save_job(&record, is_final || force).await {
        Ok(()) => {
            if is_final {
                job.data_mut().saved_in_final_state = true;
            }
        }
        Err(e) => {
            error!(job_id = %record.id, error = %e, "Failed to save job");
        }
    }
}

/// Assign the job to a scheduler. Always saved, even with history logging
/// disabled, because the scheduler id identifies the job's owner.
pub async fn set_scheduler(
    ctx: &SrmContext,
    job: &mut dyn JobBody,
    scheduler_id: &str,
    timestamp: i64,
) {
    let data = job.data_mut();
    if data.scheduler_timestamp == timestamp && data.scheduler_id.as_deref() == Some(scheduler_id)
    {
        return;
    }
    data.scheduler_id = Some(scheduler_id.to_string());
    data.scheduler_timestamp = timestamp;
    save_job(ctx, job, true).await;
}

/// Extend the job's lifetime so that `new_lifetime_millis` remain from now.
///
/// Returns the remaining lifetime if it is already at least that long,
/// otherwise the new value.
pub async fn extend_lifetime_millis(
    ctx: &SrmContext,
    job: &mut dyn JobBody,
    new_lifetime_millis: i64,
) -> Result<i64, SrmError> {
    match job.data().state {
        State::Canceled => {
            return Err(SrmError::Aborted {
                message: "can't extend lifetime, job was aborted".to_string(),
            });
        }
        State::Done => {
            return Err(SrmError::Released {
                message: "can't extend lifetime, job has finished".to_string(),
            });
        }
        State::Failed => {
            return Err(SrmError::invalid_request(
                "can't extend lifetime, job has failed",
            ));
        }
        _ => {}
    }

    let now = Utc::now();
    let data = job.data_mut();
    let remaining = (data.creation_time + data.lifetime - now).num_milliseconds();
    if remaining >= new_lifetime_millis {
        return Ok(remaining);
    }
    data.lifetime = now + TimeDelta::milliseconds(new_lifetime_millis) - data.creation_time;
    save_job(ctx, job, false).await;
    Ok(new_lifetime_millis)
}

/// Expire the job if its lifetime has passed.
///
/// READY and TRANSFERRING jobs complete; any other non-final job fails.
pub async fn check_expiration(ctx: &SrmContext, job: &mut dyn JobBody) {
    let data = job.data();
    if !data.is_expired_at(Utc::now()) {
        return;
    }
    let target = match data.state {
        State::Ready | State::Transferring => State::Done,
        state if state.is_final() => return,
        _ => State::Failed,
    };
    debug!(job_id = %data.id, "Expiring job");
    if let Err(e) = set_state(ctx, job, target, "lifetime expired", true).await {
        error!(job_id = %job.data().id, error = %e, "Illegal state transition while expiring job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(kind: JobKind) -> JobData {
        let mut data = JobData::new(kind, TimeDelta::hours(1), 3);
        data.scheduler_id = Some("test".to_string());
        data
    }

    #[test]
    fn test_new_job_is_pending_with_history() {
        let data = JobData::new(JobKind::GetFile, TimeDelta::minutes(5), 3);
        assert_eq!(data.state(), State::Pending);
        assert_eq!(data.history().len(), 1);
        assert_eq!(data.latest_description(), "Request created");
        assert!(data.error_message().is_empty());
    }

    #[test]
    fn test_apply_transition_records_history_and_errors() {
        let mut data = scheduled(JobKind::PutFile);

        assert_eq!(
            data.apply_transition(State::TQueued, "Request enqueued.").unwrap(),
            Some(State::Pending)
        );
        assert_eq!(
            data.apply_transition(State::Running, "Processing request")
                .unwrap(),
            Some(State::TQueued)
        );
        assert_eq!(data.history().len(), 3);
        assert_eq!(data.latest_history_event().unwrap().state, State::Running);
        assert!(data.error_message().starts_with("Request enqueued."));
        assert!(data.error_message().contains(" appended:\nProcessing request"));
    }

    #[test]
    fn test_apply_transition_same_state_is_noop() {
        let mut data = scheduled(JobKind::PutFile);
        let before = data.history().len();
        assert_eq!(data.apply_transition(State::Pending, "again").unwrap(), None);
        assert_eq!(data.history().len(), before);
    }

    #[test]
    fn test_illegal_transition_leaves_data_untouched() {
        let mut data = scheduled(JobKind::GetFile);
        data.apply_transition(State::Failed, "boom").unwrap();
        let history = data.history().len();

        let err = data.apply_transition(State::Running, "resurrect").unwrap_err();
        assert!(matches!(err, SrmError::IllegalStateTransition { .. }));
        assert_eq!(data.state(), State::Failed);
        assert_eq!(data.history().len(), history);
    }

    #[test]
    fn test_unscheduled_job_cannot_enter_non_final_state() {
        let mut data = JobData::new(JobKind::GetFile, TimeDelta::hours(1), 3);
        let err = data.apply_transition(State::TQueued, "x").unwrap_err();
        assert!(matches!(err, SrmError::JobNotScheduled { .. }));
        assert_eq!(data.state(), State::Pending);

        data.apply_transition(State::Canceled, "aborted").unwrap();
        assert_eq!(data.state(), State::Canceled);
    }

    #[test]
    fn test_retry_wait_increments_retries() {
        let mut data = scheduled(JobKind::BringOnlineFile);
        data.apply_transition(State::Running, "run").unwrap();
        data.apply_transition(State::RetryWait, "transient").unwrap();
        data.apply_transition(State::Running, "run").unwrap();
        data.apply_transition(State::RetryWait, "transient").unwrap();
        assert_eq!(data.retries(), 2);
    }

    #[test]
    fn test_remaining_lifetime() {
        let mut data = scheduled(JobKind::GetFile);
        let now = data.creation_time() + TimeDelta::minutes(10);
        assert_eq!(data.remaining_lifetime_at(now), TimeDelta::minutes(50));
        assert_eq!(
            data.remaining_lifetime_at(now + TimeDelta::hours(2)),
            TimeDelta::zero()
        );
        assert!(data.is_expired_at(now + TimeDelta::hours(2)));

        data.apply_transition(State::Done, "done").unwrap();
        assert_eq!(data.remaining_lifetime_at(now), TimeDelta::zero());
    }

    #[test]
    fn test_record_round_trip_keeps_history_sequence() {
        let mut data = scheduled(JobKind::CopyFile);
        data.apply_transition(State::Running, "run").unwrap();
        let record = data.to_record(Some(JobId::new()), serde_json::json!({}));

        let mut restored = JobData::from_record(&record);
        assert_eq!(restored.id(), data.id());
        assert_eq!(restored.state(), State::Running);
        assert_eq!(restored.history(), data.history());

        restored.add_history_event("restored");
        let ids: Vec<u64> = restored.history().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_priority_and_retry_budget_are_persisted() {
        let mut data = scheduled(JobKind::GetFile);
        data.set_priority(7);
        data.set_max_retries(1);

        let restored = JobData::from_record(&data.to_record(None, serde_json::json!({})));
        assert_eq!(restored.priority(), 7);
        assert_eq!(restored.max_retries(), 1);
        assert_eq!(restored.retries(), 0);
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_kind_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!(JobKind::PutRequest.is_container());
        assert!(JobKind::PutFile.is_file_request());
        assert!(!JobKind::ReserveSpace.is_container());
        assert!(!JobKind::ReserveSpace.is_file_request());
    }
}
