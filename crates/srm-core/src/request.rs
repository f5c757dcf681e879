// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-level metadata shared by container requests and reservations.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobKind;

/// The user a request was submitted by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrmUser {
    pub name: String,
    /// Read-only users may not write to storage.
    #[serde(default)]
    pub read_only: bool,
}

impl SrmUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
        }
    }
}

/// Immutable part of a top-level request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    pub user: SrmUser,
    /// Delegated credential, resolved lazily through the credential cache.
    pub credential_id: Option<String>,
    /// Client supplied request description.
    pub description: Option<String>,
    pub client_host: String,
}

impl RequestData {
    pub fn new(user: SrmUser, client_host: impl Into<String>) -> Self {
        Self {
            user,
            credential_id: None,
            description: None,
            client_host: client_host.into(),
        }
    }
}

/// Protocol operation carried out by a container request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Get,
    Put,
    BringOnline,
    Copy,
}

impl RequestType {
    pub fn container_kind(&self) -> JobKind {
        match self {
            RequestType::Get => JobKind::GetRequest,
            RequestType::Put => JobKind::PutRequest,
            RequestType::BringOnline => JobKind::BringOnlineRequest,
            RequestType::Copy => JobKind::CopyRequest,
        }
    }

    pub fn file_kind(&self) -> JobKind {
        match self {
            RequestType::Get => JobKind::GetFile,
            RequestType::Put => JobKind::PutFile,
            RequestType::BringOnline => JobKind::BringOnlineFile,
            RequestType::Copy => JobKind::CopyFile,
        }
    }

    pub fn from_container_kind(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::GetRequest => Some(RequestType::Get),
            JobKind::PutRequest => Some(RequestType::Put),
            JobKind::BringOnlineRequest => Some(RequestType::BringOnline),
            JobKind::CopyRequest => Some(RequestType::Copy),
            _ => None,
        }
    }

    /// Protocol name of the request type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Get => "PREPARE_TO_GET",
            RequestType::Put => "PREPARE_TO_PUT",
            RequestType::BringOnline => "BRING_ONLINE",
            RequestType::Copy => "COPY",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client options shared by every file of a container request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Transfer protocols the client accepts, most preferred first.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Whether uploads may replace existing files.
    #[serde(default)]
    pub overwrite: bool,
    /// Pin lifetime asked for by bring-online and get requests.
    pub desired_pin_lifetime: Option<Duration>,
    /// Space reservation uploads and copies are written into.
    pub space_token: Option<String>,
}

/// One file of a container request as submitted by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    /// The file the operation is about; the source of a copy.
    pub surl: String,
    /// Expected size, for uploads and copies.
    pub size: Option<u64>,
    /// Copy destination.
    pub destination: Option<String>,
    /// Transfer URL of the remote side of a copy, when known up front.
    pub remote_turl: Option<String>,
}

impl NewFile {
    pub fn new(surl: impl Into<String>) -> Self {
        Self {
            surl: surl.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_remote_turl(mut self, turl: impl Into<String>) -> Self {
        self.remote_turl = Some(turl.into());
        self
    }
}
