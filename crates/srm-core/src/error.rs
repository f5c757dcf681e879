// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for srm-core.
//!
//! [`SrmError`] is the unified error returned by job, request and handler
//! operations. Every variant maps onto a protocol [`StatusCode`] so no error
//! reaches the protocol boundary unmapped. [`JobFailure`] is what a job's
//! `run` signals back to its scheduler.

use std::fmt;

use crate::job::{JobId, State};
use crate::status::{ReturnStatus, StatusCode};

/// Result type using SrmError
pub type Result<T> = std::result::Result<T, SrmError>;

/// Errors raised by the request lifecycle engine.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SrmError {
    /// A state change not present in the transition table was requested.
    IllegalStateTransition {
        /// The job whose state was being changed.
        job_id: JobId,
        /// Current state.
        from: State,
        /// Requested state.
        to: State,
    },

    /// A non-final state was requested for a job that has no scheduler.
    JobNotScheduled {
        /// The job.
        job_id: JobId,
        /// Requested state.
        to: State,
    },

    /// No live job with this id.
    JobNotFound {
        /// The id that was looked up.
        job_id: String,
    },

    /// The job exists but is not of the kind the operation needs.
    WrongJobKind {
        /// The job.
        job_id: JobId,
        /// What the operation expected.
        expected: String,
    },

    /// Operation on a canceled job.
    Aborted {
        /// Explanation.
        message: String,
    },

    /// Operation on a job that already finished and released its resources.
    Released {
        /// Explanation.
        message: String,
    },

    /// The request cannot be honoured in the job's current state.
    InvalidRequest {
        /// Explanation.
        message: String,
    },

    /// The SURL does not name a usable file.
    InvalidPath {
        /// The offending SURL or path.
        path: String,
        /// Explanation.
        message: String,
    },

    /// Duplicate operation (e.g. put-done on an upload that already completed).
    DuplicationError {
        /// Explanation.
        message: String,
    },

    /// The user may not perform the operation.
    AuthorizationFailure {
        /// Explanation.
        message: String,
    },

    /// The operation is not supported for this request kind or protocol.
    NotSupported {
        /// Explanation.
        message: String,
    },

    /// No registered scheduler with this id.
    SchedulerNotFound {
        /// The scheduler id.
        scheduler_id: String,
    },

    /// The scheduler refused the job.
    SchedulingRejected {
        /// The job.
        job_id: JobId,
        /// Why it was refused.
        reason: String,
    },

    /// A job lock could not be acquired in time.
    LockTimeout {
        /// The job.
        job_id: JobId,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Unexpected internal failure.
    Internal {
        /// Explanation.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl SrmError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IllegalStateTransition { .. } => "ILLEGAL_STATE_TRANSITION",
            Self::JobNotScheduled { .. } => "JOB_NOT_SCHEDULED",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::WrongJobKind { .. } => "WRONG_JOB_KIND",
            Self::Aborted { .. } => "ABORTED",
            Self::Released { .. } => "RELEASED",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::DuplicationError { .. } => "DUPLICATION_ERROR",
            Self::AuthorizationFailure { .. } => "AUTHORIZATION_FAILURE",
            Self::NotSupported { .. } => "NOT_SUPPORTED",
            Self::SchedulerNotFound { .. } => "SCHEDULER_NOT_FOUND",
            Self::SchedulingRejected { .. } => "SCHEDULING_REJECTED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Protocol status code reported for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Aborted { .. } => StatusCode::Aborted,
            Self::Released { .. } => StatusCode::Released,
            Self::InvalidRequest { .. }
            | Self::JobNotFound { .. }
            | Self::WrongJobKind { .. }
            | Self::ValidationError { .. } => StatusCode::InvalidRequest,
            Self::InvalidPath { .. } => StatusCode::InvalidPath,
            Self::DuplicationError { .. } => StatusCode::DuplicationError,
            Self::AuthorizationFailure { .. } => StatusCode::AuthorizationFailure,
            Self::NotSupported { .. } => StatusCode::NotSupported,
            Self::IllegalStateTransition { .. }
            | Self::JobNotScheduled { .. }
            | Self::SchedulerNotFound { .. }
            | Self::SchedulingRejected { .. }
            | Self::LockTimeout { .. }
            | Self::Internal { .. }
            | Self::DatabaseError { .. } => StatusCode::InternalError,
        }
    }

    /// The error as a protocol return status.
    pub fn to_return_status(&self) -> ReturnStatus {
        ReturnStatus::new(self.status_code(), self.to_string())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

impl fmt::Display for SrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalStateTransition { job_id, from, to } => {
                write!(
                    f,
                    "Illegal state transition for job {}: {} -> {}",
                    job_id, from, to
                )
            }
            Self::JobNotScheduled { job_id, to } => {
                write!(
                    f,
                    "Job {} cannot enter {} because it is not scheduled",
                    job_id, to
                )
            }
            Self::JobNotFound { job_id } => write!(f, "Job '{}' not found", job_id),
            Self::WrongJobKind { job_id, expected } => {
                write!(f, "Job {} is not a {}", job_id, expected)
            }
            Self::Aborted { message }
            | Self::Released { message }
            | Self::InvalidRequest { message }
            | Self::DuplicationError { message }
            | Self::AuthorizationFailure { message }
            | Self::NotSupported { message }
            | Self::Internal { message } => f.write_str(message),
            Self::InvalidPath { path, message } => write!(f, "{}: {}", path, message),
            Self::SchedulerNotFound { scheduler_id } => {
                write!(f, "Scheduler '{}' not found", scheduler_id)
            }
            Self::SchedulingRejected { job_id, reason } => {
                write!(f, "Job {} was not scheduled: {}", job_id, reason)
            }
            Self::LockTimeout { job_id } => {
                write!(f, "Timed out waiting for the lock of job {}", job_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for SrmError {}

impl From<sqlx::Error> for SrmError {
    fn from(err: sqlx::Error) -> Self {
        SrmError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SrmError {
    fn from(err: serde_json::Error) -> Self {
        SrmError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Outcome of a failed `run`.
///
/// Non-fatal failures are retried through RETRYWAIT until the job's retry
/// budget is spent; fatal ones move the job straight to FAILED.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    /// Transient failure, worth retrying.
    #[error("{message}")]
    NonFatal {
        /// Explanation.
        message: String,
    },

    /// Permanent failure with the status code to report.
    #[error("{message}")]
    Fatal {
        /// Explanation.
        message: String,
        /// Status code stored on the job.
        status: StatusCode,
    },
}

impl JobFailure {
    pub fn non_fatal(message: impl Into<String>) -> Self {
        Self::NonFatal {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>, status: StatusCode) -> Self {
        Self::Fatal {
            message: message.into(),
            status,
        }
    }

    /// Status code to store when the failure ends the job.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NonFatal { .. } => StatusCode::InternalError,
            Self::Fatal { status, .. } => *status,
        }
    }
}

impl From<SrmError> for JobFailure {
    fn from(err: SrmError) -> Self {
        match err {
            SrmError::LockTimeout { .. } | SrmError::DatabaseError { .. } => {
                JobFailure::non_fatal(err.to_string())
            }
            other => JobFailure::fatal(other.to_string(), other.status_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status_codes() {
        let id = JobId::new();
        let test_cases = vec![
            (
                SrmError::IllegalStateTransition {
                    job_id: id,
                    from: State::Done,
                    to: State::Running,
                },
                "ILLEGAL_STATE_TRANSITION",
                StatusCode::InternalError,
            ),
            (
                SrmError::Aborted {
                    message: "can't extend lifetime, job was aborted".to_string(),
                },
                "ABORTED",
                StatusCode::Aborted,
            ),
            (
                SrmError::Released {
                    message: "can't extend lifetime, job has finished".to_string(),
                },
                "RELEASED",
                StatusCode::Released,
            ),
            (
                SrmError::JobNotFound {
                    job_id: "nope".to_string(),
                },
                "JOB_NOT_FOUND",
                StatusCode::InvalidRequest,
            ),
            (
                SrmError::InvalidPath {
                    path: "/a".to_string(),
                    message: "not a file".to_string(),
                },
                "INVALID_PATH",
                StatusCode::InvalidPath,
            ),
            (
                SrmError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "locked".to_string(),
                },
                "DATABASE_ERROR",
                StatusCode::InternalError,
            ),
        ];

        for (error, code, status) in test_cases {
            assert_eq!(error.error_code(), code);
            assert_eq!(error.status_code(), status);
            assert_eq!(error.to_return_status().code, status);
        }
    }

    #[test]
    fn test_display_messages() {
        let id = JobId::new();
        let err = SrmError::IllegalStateTransition {
            job_id: id,
            from: State::Done,
            to: State::Running,
        };
        assert_eq!(
            err.to_string(),
            format!("Illegal state transition for job {}: DONE -> RUNNING", id)
        );

        let err = SrmError::ValidationError {
            field: "surl".to_string(),
            message: "must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Validation error for 'surl': must not be empty"
        );
    }

    #[test]
    fn test_job_failure_from_error() {
        let failure: JobFailure = SrmError::AuthorizationFailure {
            message: "denied".to_string(),
        }
        .into();
        assert_eq!(
            failure,
            JobFailure::fatal("denied", StatusCode::AuthorizationFailure)
        );

        let failure: JobFailure = SrmError::LockTimeout { job_id: JobId::new() }.into();
        assert!(matches!(failure, JobFailure::NonFatal { .. }));
        assert_eq!(failure.status_code(), StatusCode::InternalError);
    }
}
