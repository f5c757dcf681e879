// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backend contract.
//!
//! The engine never performs storage operations itself. Every pin, space
//! reservation, upload and transfer goes through a [`StorageBackend`]. Calls
//! that the engine must not wait for on a scheduler worker are issued through
//! [`crate::callbacks::spawn_backend_call`], which turns the returned future
//! into a completion delivered to the job by id.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::RequestCredential;
use crate::error::JobFailure;
use crate::job::JobId;
use crate::request::SrmUser;
use crate::status::StatusCode;

pub use local::LocalFsStorage;

/// Typed outcome of a failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Duplication(String),

    #[error("permission denied: {0}")]
    AuthorizationFailure(String),

    #[error("no free space: {0}")]
    NoFreeSpace(String),

    #[error("space lifetime expired: {0}")]
    SpaceLifetimeExpired(String),

    #[error("space released: {0}")]
    SpaceReleased(String),

    #[error("file busy: {0}")]
    FileBusy(String),

    #[error("file unavailable: {0}")]
    FileUnavailable(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("backend call timed out")]
    Timeout,

    /// Transient internal failure; the operation may be retried.
    #[error("internal storage error: {0}")]
    Internal(String),

    #[error("{0}")]
    Failed(String),
}

impl StorageError {
    /// Protocol status code a job fails with for this outcome.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPath(_) => StatusCode::InvalidPath,
            Self::Duplication(_) => StatusCode::DuplicationError,
            Self::AuthorizationFailure(_) => StatusCode::AuthorizationFailure,
            Self::NoFreeSpace(_) | Self::SpaceReleased(_) => StatusCode::NoFreeSpace,
            Self::SpaceLifetimeExpired(_) => StatusCode::SpaceLifetimeExpired,
            Self::FileBusy(_) => StatusCode::FileBusy,
            Self::FileUnavailable(_) => StatusCode::FileUnavailable,
            Self::NotSupported(_) => StatusCode::NotSupported,
            Self::Timeout => StatusCode::RequestTimedOut,
            Self::Internal(_) => StatusCode::InternalError,
            Self::Failed(_) => StatusCode::Failure,
        }
    }

    /// Whether retrying the call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<StorageError> for JobFailure {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            JobFailure::non_fatal(err.to_string())
        } else {
            JobFailure::fatal(err.to_string(), err.status_code())
        }
    }
}

/// Namespace information about a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub size: u64,
    pub is_directory: bool,
}

/// A granted pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedFile {
    pub file_id: String,
    pub pin_id: String,
}

/// An upload slot created by prepare-to-put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpload {
    pub file_id: String,
    /// Default space token of the parent directory, if any.
    pub default_space_token: Option<String>,
}

/// A granted space reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: String,
    pub size_in_bytes: u64,
    pub lifetime: Duration,
}

/// Direction of a third-party transfer, seen from the local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Fetch `remote_turl` into the local upload identified by `file_id`.
    Pull {
        remote_turl: String,
        local_surl: String,
        file_id: String,
    },
    /// Send the local file to `remote_turl`.
    Push {
        local_surl: String,
        remote_turl: String,
    },
}

/// Operations the engine needs from a storage system.
///
/// Every call takes the user on whose behalf it runs. Futures must be
/// `Send`; the engine spawns them and applies the configured storage timeout.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Transfer protocols offered for downloads, most preferred first.
    fn supported_get_protocols(&self) -> Vec<String>;

    /// Transfer protocols offered for uploads, most preferred first.
    fn supported_put_protocols(&self) -> Vec<String>;

    /// Whether the SURL belongs to this storage.
    fn is_local_surl(&self, surl: &str) -> bool;

    async fn get_file_info(&self, user: &SrmUser, surl: &str)
    -> Result<FileMetadata, StorageError>;

    /// Pin a file online for `lifetime`. `request_id` tags the pin owner.
    async fn pin_file(
        &self,
        user: &SrmUser,
        surl: &str,
        lifetime: Duration,
        request_id: JobId,
    ) -> Result<PinnedFile, StorageError>;

    async fn unpin_file(
        &self,
        user: &SrmUser,
        file_id: &str,
        pin_id: &str,
    ) -> Result<(), StorageError>;

    /// Returns the lifetime actually granted.
    async fn extend_pin_lifetime(
        &self,
        user: &SrmUser,
        file_id: &str,
        pin_id: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError>;

    async fn get_turl(
        &self,
        user: &SrmUser,
        surl: &str,
        protocols: &[String],
    ) -> Result<String, StorageError>;

    async fn prepare_to_put(
        &self,
        user: &SrmUser,
        surl: &str,
        size: Option<u64>,
        overwrite: bool,
    ) -> Result<PreparedUpload, StorageError>;

    async fn put_turl(
        &self,
        user: &SrmUser,
        surl: &str,
        file_id: &str,
        protocols: &[String],
    ) -> Result<String, StorageError>;

    async fn put_done(&self, user: &SrmUser, file_id: &str, surl: &str)
    -> Result<(), StorageError>;

    async fn abort_put(
        &self,
        user: &SrmUser,
        file_id: &str,
        surl: &str,
        reason: &str,
    ) -> Result<(), StorageError>;

    async fn exists(&self, user: &SrmUser, surl: &str) -> Result<bool, StorageError>;

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size_in_bytes: u64,
        lifetime: Duration,
        description: Option<String>,
    ) -> Result<Reservation, StorageError>;

    async fn release_space(&self, user: &SrmUser, token: &str) -> Result<(), StorageError>;

    async fn mark_space_in_use(
        &self,
        user: &SrmUser,
        token: &str,
        surl: &str,
        size_in_bytes: u64,
        lifetime: Duration,
    ) -> Result<(), StorageError>;

    async fn unmark_space_in_use(
        &self,
        user: &SrmUser,
        token: &str,
        surl: &str,
    ) -> Result<(), StorageError>;

    /// Returns the lifetime actually granted.
    async fn extend_reservation_lifetime(
        &self,
        user: &SrmUser,
        token: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError>;

    /// Copy between two files of this storage; the destination was prepared
    /// with [`StorageBackend::prepare_to_put`].
    async fn local_copy(
        &self,
        user: &SrmUser,
        from_surl: &str,
        to_file_id: &str,
    ) -> Result<(), StorageError>;

    /// Run a third-party transfer to completion.
    async fn transfer(
        &self,
        user: &SrmUser,
        transfer_id: &str,
        direction: TransferDirection,
        credential: Option<RequestCredential>,
    ) -> Result<(), StorageError>;

    async fn kill_transfer(&self, transfer_id: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_status_codes() {
        let cases = vec![
            (
                StorageError::InvalidPath("/x".into()),
                StatusCode::InvalidPath,
            ),
            (
                StorageError::Duplication("exists".into()),
                StatusCode::DuplicationError,
            ),
            (
                StorageError::AuthorizationFailure("no".into()),
                StatusCode::AuthorizationFailure,
            ),
            (
                StorageError::NoFreeSpace("full".into()),
                StatusCode::NoFreeSpace,
            ),
            (
                StorageError::SpaceReleased("gone".into()),
                StatusCode::NoFreeSpace,
            ),
            (
                StorageError::SpaceLifetimeExpired("old".into()),
                StatusCode::SpaceLifetimeExpired,
            ),
            (StorageError::Timeout, StatusCode::RequestTimedOut),
        ];
        for (err, code) in cases {
            assert_eq!(err.status_code(), code, "{:?}", err);
        }
    }

    #[test]
    fn test_only_internal_errors_are_retried() {
        let failure: JobFailure = StorageError::Internal("flaky".into()).into();
        assert!(matches!(failure, JobFailure::NonFatal { .. }));

        let failure: JobFailure = StorageError::InvalidPath("/x".into()).into();
        assert_eq!(failure.status_code(), StatusCode::InvalidPath);
    }
}
