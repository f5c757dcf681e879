// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol status codes and the return-status values built from them.
//!
//! Every job eventually reports a [`ReturnStatus`]: a [`StatusCode`] plus an
//! optional human-readable explanation taken from the job's history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol-level status code reported for requests and file requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    Failure,
    AuthenticationFailure,
    AuthorizationFailure,
    InvalidRequest,
    InvalidPath,
    FileLifetimeExpired,
    SpaceLifetimeExpired,
    ExceedAllocation,
    NoUserSpace,
    NoFreeSpace,
    DuplicationError,
    NonEmptyDirectory,
    TooManyResults,
    InternalError,
    FatalInternalError,
    NotSupported,
    RequestQueued,
    RequestInProgress,
    RequestSuspended,
    Aborted,
    Released,
    FilePinned,
    FileInCache,
    SpaceAvailable,
    LowerSpaceGranted,
    Done,
    PartialSuccess,
    RequestTimedOut,
    LastCopy,
    FileBusy,
    FileLost,
    FileUnavailable,
    CustomStatus,
}

impl StatusCode {
    /// All status codes, in protocol order.
    pub const ALL: [StatusCode; 34] = [
        Self::Success,
        Self::Failure,
        Self::AuthenticationFailure,
        Self::AuthorizationFailure,
        Self::InvalidRequest,
        Self::InvalidPath,
        Self::FileLifetimeExpired,
        Self::SpaceLifetimeExpired,
        Self::ExceedAllocation,
        Self::NoUserSpace,
        Self::NoFreeSpace,
        Self::DuplicationError,
        Self::NonEmptyDirectory,
        Self::TooManyResults,
        Self::InternalError,
        Self::FatalInternalError,
        Self::NotSupported,
        Self::RequestQueued,
        Self::RequestInProgress,
        Self::RequestSuspended,
        Self::Aborted,
        Self::Released,
        Self::FilePinned,
        Self::FileInCache,
        Self::SpaceAvailable,
        Self::LowerSpaceGranted,
        Self::Done,
        Self::PartialSuccess,
        Self::RequestTimedOut,
        Self::LastCopy,
        Self::FileBusy,
        Self::FileLost,
        Self::FileUnavailable,
        Self::CustomStatus,
    ];

    /// Wire name of the code (e.g. `SRM_SUCCESS`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SRM_SUCCESS",
            Self::Failure => "SRM_FAILURE",
            Self::AuthenticationFailure => "SRM_AUTHENTICATION_FAILURE",
            Self::AuthorizationFailure => "SRM_AUTHORIZATION_FAILURE",
            Self::InvalidRequest => "SRM_INVALID_REQUEST",
            Self::InvalidPath => "SRM_INVALID_PATH",
            Self::FileLifetimeExpired => "SRM_FILE_LIFETIME_EXPIRED",
            Self::SpaceLifetimeExpired => "SRM_SPACE_LIFETIME_EXPIRED",
            Self::ExceedAllocation => "SRM_EXCEED_ALLOCATION",
            Self::NoUserSpace => "SRM_NO_USER_SPACE",
            Self::NoFreeSpace => "SRM_NO_FREE_SPACE",
            Self::DuplicationError => "SRM_DUPLICATION_ERROR",
            Self::NonEmptyDirectory => "SRM_NON_EMPTY_DIRECTORY",
            Self::TooManyResults => "SRM_TOO_MANY_RESULTS",
            Self::InternalError => "SRM_INTERNAL_ERROR",
            Self::FatalInternalError => "SRM_FATAL_INTERNAL_ERROR",
            Self::NotSupported => "SRM_NOT_SUPPORTED",
            Self::RequestQueued => "SRM_REQUEST_QUEUED",
            Self::RequestInProgress => "SRM_REQUEST_INPROGRESS",
            Self::RequestSuspended => "SRM_REQUEST_SUSPENDED",
            Self::Aborted => "SRM_ABORTED",
            Self::Released => "SRM_RELEASED",
            Self::FilePinned => "SRM_FILE_PINNED",
            Self::FileInCache => "SRM_FILE_IN_CACHE",
            Self::SpaceAvailable => "SRM_SPACE_AVAILABLE",
            Self::LowerSpaceGranted => "SRM_LOWER_SPACE_GRANTED",
            Self::Done => "SRM_DONE",
            Self::PartialSuccess => "SRM_PARTIAL_SUCCESS",
            Self::RequestTimedOut => "SRM_REQUEST_TIMED_OUT",
            Self::LastCopy => "SRM_LAST_COPY",
            Self::FileBusy => "SRM_FILE_BUSY",
            Self::FileLost => "SRM_FILE_LOST",
            Self::FileUnavailable => "SRM_FILE_UNAVAILABLE",
            Self::CustomStatus => "SRM_CUSTOM_STATUS",
        }
    }

    /// Whether a file-level status reports a failed outcome.
    ///
    /// Queued, in-progress, pinned/available and successful codes are not
    /// failures; everything else is.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            Self::Success
                | Self::RequestQueued
                | Self::RequestInProgress
                | Self::RequestSuspended
                | Self::Released
                | Self::FilePinned
                | Self::FileInCache
                | Self::SpaceAvailable
                | Self::LowerSpaceGranted
                | Self::Done
                | Self::PartialSuccess
                | Self::LastCopy
        )
    }

    /// Whether the code means "still being worked on".
    pub fn is_processing(&self) -> bool {
        matches!(self, Self::RequestQueued | Self::RequestInProgress)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status code name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status code: {0}")]
pub struct UnknownStatusCode(pub String);

impl FromStr for StatusCode {
    type Err = UnknownStatusCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownStatusCode(s.to_string()))
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// A status code plus an optional explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnStatus {
    pub code: StatusCode,
    pub explanation: Option<String>,
}

impl ReturnStatus {
    pub fn new(code: StatusCode, explanation: impl Into<Option<String>>) -> Self {
        Self {
            code,
            explanation: explanation.into(),
        }
    }

    /// A status without explanation.
    pub fn bare(code: StatusCode) -> Self {
        Self {
            code,
            explanation: None,
        }
    }

    pub fn success() -> Self {
        Self::bare(StatusCode::Success)
    }

    /// Summary status for an operation applied to several files.
    ///
    /// Partial success if some succeeded and some failed; failure if none
    /// succeeded; success otherwise.
    pub fn summary(has_failure: bool, has_success: bool) -> Self {
        match (has_failure, has_success) {
            (true, true) => Self::new(
                StatusCode::PartialSuccess,
                "Some file requests failed".to_string(),
            ),
            (true, false) => Self::new(
                StatusCode::Failure,
                "All file requests failed".to_string(),
            ),
            _ => Self::success(),
        }
    }
}

impl fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.explanation {
            Some(explanation) => write!(f, "{}: {}", self.code, explanation),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Per-request counts reported alongside the overall status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_token: String,
    pub request_type: String,
    pub status: ReturnStatus,
    pub total_files: usize,
    pub failed_files: usize,
    pub completed_files: usize,
    pub waiting_files: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_names_round_trip() {
        for code in StatusCode::ALL {
            let parsed: StatusCode = code.as_str().parse().unwrap();
            assert_eq!(parsed, code);
        }
        assert!("SRM_NOPE".parse::<StatusCode>().is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert!(StatusCode::Failure.is_failure());
        assert!(StatusCode::Aborted.is_failure());
        assert!(StatusCode::NoFreeSpace.is_failure());
        assert!(StatusCode::FileBusy.is_failure());
        assert!(!StatusCode::FilePinned.is_failure());
        assert!(!StatusCode::Released.is_failure());
        assert!(!StatusCode::RequestQueued.is_failure());
    }

    #[test]
    fn test_summary_status() {
        assert_eq!(ReturnStatus::summary(false, true).code, StatusCode::Success);
        assert_eq!(
            ReturnStatus::summary(true, true).code,
            StatusCode::PartialSuccess
        );
        assert_eq!(ReturnStatus::summary(true, false).code, StatusCode::Failure);
        assert_eq!(ReturnStatus::summary(false, false).code, StatusCode::Success);
    }

    #[test]
    fn test_status_code_serde_uses_wire_names() {
        let json = serde_json::to_string(&StatusCode::SpaceAvailable).unwrap();
        assert_eq!(json, "\"SRM_SPACE_AVAILABLE\"");
        let back: StatusCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StatusCode::SpaceAvailable);
    }
}
