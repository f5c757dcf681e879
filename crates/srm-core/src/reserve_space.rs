// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Explicit space reservations.
//!
//! A reservation is a plain request with no file requests. It runs once,
//! asks the storage for space and completes when the reservation is
//! granted. The space outlives the request; it belongs to the client from
//! then on and is released through the storage, not through this request.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::callbacks::{Completion, spawn_backend_call};
use crate::context::SrmContext;
use crate::error::{JobFailure, SrmError};
use crate::file_request::remaining_lease;
use crate::job::{self, JobBody, JobData, JobId, JobKind, State};
use crate::persistence::JobRecord;
use crate::request::RequestData;
use crate::status::{ReturnStatus, StatusCode};
use crate::storage::StorageError;

/// Persisted fields of a space reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSpacePayload {
    pub request: RequestData,
    pub size_in_bytes: u64,
    /// Requested lifetime of the reservation; the request's own lifetime
    /// when absent.
    pub desired_lifetime: Option<Duration>,
    pub space_description: Option<String>,
    pub space_token: Option<String>,
    pub granted_size: Option<u64>,
    pub granted_lifetime: Option<Duration>,
}

/// Client facing status of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReserveSpaceStatus {
    pub request_token: String,
    pub state: State,
    pub status: ReturnStatus,
    pub space_token: Option<String>,
    pub size_in_bytes: Option<u64>,
    pub lifetime_secs: Option<u64>,
}

pub struct ReserveSpaceRequest {
    id: JobId,
    pub(crate) inner: Mutex<ReserveSpaceState>,
}

/// Mutable part of a [`ReserveSpaceRequest`].
pub struct ReserveSpaceState {
    pub(crate) data: JobData,
    pub(crate) payload: ReserveSpacePayload,
    pub(crate) pending_error: Option<StorageError>,
}

impl ReserveSpaceRequest {
    pub fn new(
        request: RequestData,
        size_in_bytes: u64,
        desired_lifetime: Option<Duration>,
        space_description: Option<String>,
        lifetime: TimeDelta,
        max_retries: u32,
    ) -> Self {
        let data = JobData::new(JobKind::ReserveSpace, lifetime, max_retries);
        Self {
            id: data.id(),
            inner: Mutex::new(ReserveSpaceState {
                data,
                payload: ReserveSpacePayload {
                    request,
                    size_in_bytes,
                    desired_lifetime,
                    space_description,
                    space_token: None,
                    granted_size: None,
                    granted_lifetime: None,
                },
                pending_error: None,
            }),
        }
    }

    pub(crate) fn restore(record: &JobRecord) -> Result<Self, SrmError> {
        let payload: ReserveSpacePayload = serde_json::from_value(record.payload.clone())?;
        Ok(Self {
            id: record.id,
            inner: Mutex::new(ReserveSpaceState {
                data: JobData::from_record(record),
                payload,
                pending_error: None,
            }),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn status(&self) -> ReserveSpaceStatus {
        let state = self.inner.lock().await;
        ReserveSpaceStatus {
            request_token: self.id.to_string(),
            state: state.data.state,
            status: state.return_status(),
            space_token: state.payload.space_token.clone(),
            size_in_bytes: state.payload.granted_size,
            lifetime_secs: state.payload.granted_lifetime.map(|lifetime| lifetime.as_secs()),
        }
    }

    /// Cancel the reservation request. A reservation already granted is
    /// left to the client to release.
    pub async fn abort(&self, ctx: &SrmContext, reason: &str) -> ReturnStatus {
        let mut state = self.inner.lock().await;
        if state.data.state.is_final() {
            return state.return_status();
        }
        match job::set_state(ctx, &mut *state, State::Canceled, reason, true).await {
            Ok(()) => ReturnStatus::success(),
            Err(e) => e.to_return_status(),
        }
    }
}

impl std::fmt::Debug for ReserveSpaceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReserveSpaceRequest")
            .field("id", &self.id)
            .finish()
    }
}

impl ReserveSpaceState {
    pub(crate) fn return_status(&self) -> ReturnStatus {
        let description = Some(self.data.latest_description());
        match self.data.state {
            State::Done => match self.payload.granted_size {
                Some(granted) if granted < self.payload.size_in_bytes => {
                    ReturnStatus::bare(StatusCode::LowerSpaceGranted)
                }
                _ => ReturnStatus::success(),
            },
            State::Failed => ReturnStatus::new(
                self.data.status_code.unwrap_or(StatusCode::Failure),
                description,
            ),
            State::Canceled => ReturnStatus::new(StatusCode::Aborted, description),
            State::Pending | State::TQueued | State::RetryWait => {
                ReturnStatus::new(StatusCode::RequestQueued, description)
            }
            _ => ReturnStatus::new(StatusCode::RequestInProgress, description),
        }
    }
}

#[async_trait::async_trait]
impl JobBody for ReserveSpaceState {
    fn data(&self) -> &JobData {
        &self.data
    }

    fn data_mut(&mut self) -> &mut JobData {
        &mut self.data
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or_default()
    }

    async fn run(&mut self, ctx: &SrmContext) -> Result<(), JobFailure> {
        if let Some(err) = self.pending_error.take() {
            return Err(err.into());
        }
        if self.payload.space_token.is_some() {
            job::set_state(ctx, self, State::Done, "Space reservation granted.", true).await?;
            return Ok(());
        }
        job::set_state(
            ctx,
            self,
            State::AsyncWait,
            "waiting Space Reservation completion",
            false,
        )
        .await?;

        let storage = ctx.storage.clone();
        let user = self.payload.request.user.clone();
        let size = self.payload.size_in_bytes;
        let lifetime = self
            .payload
            .desired_lifetime
            .unwrap_or_else(|| remaining_lease(&self.data));
        let description = self.payload.space_description.clone();
        spawn_backend_call(
            ctx,
            self.data.id,
            async move { storage.reserve_space(&user, size, lifetime, description).await },
            Completion::ReserveSpace,
        );
        Ok(())
    }

    async fn on_completion(
        &mut self,
        ctx: &SrmContext,
        completion: Completion,
    ) -> Result<bool, SrmError> {
        match completion {
            Completion::ReserveSpace(Ok(reservation)) => {
                if self.data.state != State::AsyncWait {
                    return Ok(false);
                }
                info!(
                    job_id = %self.data.id,
                    token = %reservation.token,
                    size = reservation.size_in_bytes,
                    "Space reserved"
                );
                self.payload.space_token = Some(reservation.token);
                self.payload.granted_size = Some(reservation.size_in_bytes);
                self.payload.granted_lifetime = Some(reservation.lifetime);
                job::set_state(ctx, self, State::Done, "Space reservation granted.", true).await?;
                Ok(false)
            }
            Completion::ReserveSpace(Err(e)) if e.is_transient() => {
                self.pending_error = Some(e);
                Ok(self.data.state == State::AsyncWait)
            }
            Completion::ReserveSpace(Err(e)) => {
                warn!(job_id = %self.data.id, error = %e, "Space reservation failed");
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
    use crate::request::SrmUser;

    fn request(size: u64) -> ReserveSpaceRequest {
        ReserveSpaceRequest::new(
            RequestData::new(SrmUser::new("alice"), "client"),
            size,
            None,
            Some("scratch".to_string()),
            TimeDelta::hours(1),
            3,
        )
    }

    #[test]
    fn test_new_reservation_is_queued() {
        let request = request(1024);
        let state = request.inner.try_lock().unwrap();
        assert_eq!(state.return_status().code, StatusCode::RequestQueued);
    }

    #[test]
    fn test_lower_space_granted() {
        let request = request(1024);
        let mut state = request.inner.try_lock().unwrap();
        state.data.scheduler_id = Some("test".to_string());
        state.data.apply_transition(State::Running, "run").unwrap();
        state.data.apply_transition(State::Done, "granted").unwrap();

        state.payload.granted_size = Some(1024);
        assert_eq!(state.return_status().code, StatusCode::Success);
        state.payload.granted_size = Some(512);
        assert_eq!(state.return_status().code, StatusCode::LowerSpaceGranted);
    }

    #[test]
    fn test_failed_reservation_reports_its_code() {
        let request = request(1024);
        let mut state = request.inner.try_lock().unwrap();
        state.data.status_code = Some(StatusCode::NoFreeSpace);
        state.data.apply_transition(State::Failed, "no free space: full").unwrap();
        let status = state.return_status();
        assert_eq!(status.code, StatusCode::NoFreeSpace);
        assert_eq!(status.explanation.as_deref(), Some("no free space: full"));
    }
}
