// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backend over a local directory tree.
//!
//! SURLs of the form `srm://<host>/<path>` map onto `<root>/<path>`. Uploads
//! are written to a hidden sibling file and renamed into place on put-done.
//! Pins, space reservations and running transfers are kept in memory only.
//! The only transfer protocol is `file`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credential::RequestCredential;
use crate::job::JobId;
use crate::request::SrmUser;

use super::{
    FileMetadata, PinnedFile, PreparedUpload, Reservation, StorageBackend, StorageError,
    TransferDirection,
};

const FILE_PROTOCOL: &str = "file";

#[derive(Debug, Clone)]
struct Upload {
    surl: String,
    path: PathBuf,
    staging: PathBuf,
}

#[derive(Debug, Clone)]
struct Pin {
    file_id: String,
    owner: String,
    expires: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Space {
    owner: String,
    size_in_bytes: u64,
    expires: DateTime<Utc>,
    used: HashMap<String, u64>,
}

impl Space {
    fn free(&self) -> u64 {
        self.size_in_bytes
            .saturating_sub(self.used.values().sum::<u64>())
    }
}

/// [`StorageBackend`] serving files under a root directory.
#[derive(Debug)]
pub struct LocalFsStorage {
    root: PathBuf,
    host: String,
    capacity: Option<u64>,
    uploads: DashMap<String, Upload>,
    pins: DashMap<String, Pin>,
    spaces: DashMap<String, Space>,
    transfers: DashMap<String, AbortHandle>,
    /// Space token new files under a directory are written into.
    directory_tokens: DashMap<PathBuf, String>,
}

fn to_duration(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

fn expiry(lifetime: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(lifetime).unwrap_or_else(|_| TimeDelta::days(36_500));
    Utc::now().checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            StorageError::InvalidPath(format!("{}: no such file", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            StorageError::AuthorizationFailure(path.display().to_string())
        }
        _ => StorageError::Internal(format!("{}: {}", path.display(), err)),
    }
}

fn file_turl(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn turl_path(turl: &str) -> Result<PathBuf, StorageError> {
    turl.strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| StorageError::NotSupported(format!("unsupported transfer URL: {}", turl)))
}

impl LocalFsStorage {
    /// Storage for SURLs on `host`, served from `root`.
    pub fn new(root: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            capacity: None,
            uploads: DashMap::new(),
            pins: DashMap::new(),
            spaces: DashMap::new(),
            transfers: DashMap::new(),
            directory_tokens: DashMap::new(),
        }
    }

    /// Limit the total size of space reservations.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Make `token` the default space of uploads under the directory
    /// `directory_surl`.
    pub fn set_directory_space_token(
        &self,
        directory_surl: &str,
        token: impl Into<String>,
    ) -> Result<(), StorageError> {
        let path = self.resolve(directory_surl)?;
        self.directory_tokens.insert(path, token.into());
        Ok(())
    }

    /// Default space token of the closest enclosing directory.
    fn inherited_space_token(&self, path: &Path) -> Option<String> {
        path.ancestors()
            .skip(1)
            .find_map(|dir| self.directory_tokens.get(dir).map(|token| token.clone()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file named by a local SURL.
    ///
    /// Accepts `srm://host/path`, `srm://host:port/path` and the
    /// `srm://host/srm/managerv2?SFN=/path` form.
    pub fn resolve(&self, surl: &str) -> Result<PathBuf, StorageError> {
        let rest = surl
            .strip_prefix("srm://")
            .ok_or_else(|| StorageError::InvalidPath(format!("not an SRM URL: {}", surl)))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidPath(format!("no path in {}", surl)))?;
        let host = authority.split(':').next().unwrap_or_default();
        if host != self.host {
            return Err(StorageError::InvalidPath(format!(
                "{} is not on this storage",
                surl
            )));
        }
        let path = match path.split_once("?SFN=") {
            Some((_, sfn)) => sfn,
            None => path,
        };

        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath(format!(
                        "{}: path escapes the storage root",
                        surl
                    )));
                }
            }
        }
        if resolved == self.root {
            return Err(StorageError::InvalidPath(format!("{}: empty path", surl)));
        }
        Ok(resolved)
    }

    fn file_id_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn staging_path(path: &Path, file_id: &str) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.upload-{}", name, file_id))
    }

    fn upload(&self, file_id: &str) -> Result<Upload, StorageError> {
        self.uploads
            .get(file_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::InvalidPath(format!("no upload with id {}", file_id)))
    }

    fn check_writable(user: &SrmUser) -> Result<(), StorageError> {
        if user.read_only {
            return Err(StorageError::AuthorizationFailure(format!(
                "user {} is read-only",
                user.name
            )));
        }
        Ok(())
    }

    fn check_protocols(protocols: &[String]) -> Result<(), StorageError> {
        if protocols.iter().any(|protocol| protocol == FILE_PROTOCOL) {
            Ok(())
        } else {
            Err(StorageError::NotSupported(format!(
                "none of [{}] is supported",
                protocols.join(", ")
            )))
        }
    }

    fn reserved_total(&self) -> u64 {
        self.spaces
            .iter()
            .filter(|entry| entry.value().expires > Utc::now())
            .map(|entry| entry.value().size_in_bytes)
            .sum()
    }

    /// Run a copy on its own task so [`StorageBackend::kill_transfer`] can
    /// abort it.
    async fn run_transfer(
        &self,
        transfer_id: &str,
        from: PathBuf,
        to: PathBuf,
    ) -> Result<(), StorageError> {
        let task = tokio::spawn({
            let from = from.clone();
            async move { tokio::fs::copy(&from, &to).await.map(|_| ()) }
        });
        self.transfers
            .insert(transfer_id.to_string(), task.abort_handle());
        let outcome = task.await;
        self.transfers.remove(transfer_id);
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(io_error(&from, e)),
            Err(e) if e.is_cancelled() => {
                Err(StorageError::Failed(format!("transfer {} was killed", transfer_id)))
            }
            Err(e) => Err(StorageError::Internal(e.to_string())),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFsStorage {
    fn supported_get_protocols(&self) -> Vec<String> {
        vec![FILE_PROTOCOL.to_string()]
    }

    fn supported_put_protocols(&self) -> Vec<String> {
        vec![FILE_PROTOCOL.to_string()]
    }

    fn is_local_surl(&self, surl: &str) -> bool {
        self.resolve(surl).is_ok()
    }

    async fn get_file_info(
        &self,
        _user: &SrmUser,
        surl: &str,
    ) -> Result<FileMetadata, StorageError> {
        let path = self.resolve(surl)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(FileMetadata {
            file_id: self.file_id_of(&path),
            size: metadata.len(),
            is_directory: metadata.is_dir(),
        })
    }

    async fn pin_file(
        &self,
        user: &SrmUser,
        surl: &str,
        lifetime: Duration,
        request_id: JobId,
    ) -> Result<PinnedFile, StorageError> {
        let info = self.get_file_info(user, surl).await?;
        if info.is_directory {
            return Err(StorageError::InvalidPath(format!("{} is a directory", surl)));
        }
        let pin_id = Uuid::new_v4().to_string();
        self.pins.insert(
            pin_id.clone(),
            Pin {
                file_id: info.file_id.clone(),
                owner: user.name.clone(),
                expires: expiry(lifetime),
            },
        );
        debug!(surl, pin_id = %pin_id, request_id = %request_id, "File pinned");
        Ok(PinnedFile {
            file_id: info.file_id,
            pin_id,
        })
    }

    async fn unpin_file(
        &self,
        _user: &SrmUser,
        file_id: &str,
        pin_id: &str,
    ) -> Result<(), StorageError> {
        match self.pins.remove_if(pin_id, |_, pin| pin.file_id == file_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::InvalidPath(format!(
                "file {} has no pin {}",
                file_id, pin_id
            ))),
        }
    }

    async fn extend_pin_lifetime(
        &self,
        user: &SrmUser,
        file_id: &str,
        pin_id: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError> {
        let mut pin = self
            .pins
            .get_mut(pin_id)
            .filter(|pin| pin.file_id == file_id)
            .ok_or_else(|| {
                StorageError::InvalidPath(format!("file {} has no pin {}", file_id, pin_id))
            })?;
        if pin.owner != user.name {
            return Err(StorageError::AuthorizationFailure(format!(
                "pin {} belongs to another user",
                pin_id
            )));
        }
        pin.expires = expiry(lifetime);
        Ok(lifetime)
    }

    async fn get_turl(
        &self,
        _user: &SrmUser,
        surl: &str,
        protocols: &[String],
    ) -> Result<String, StorageError> {
        Self::check_protocols(protocols)?;
        let path = self.resolve(surl)?;
        Ok(file_turl(&path))
    }

    async fn prepare_to_put(
        &self,
        user: &SrmUser,
        surl: &str,
        size: Option<u64>,
        overwrite: bool,
    ) -> Result<PreparedUpload, StorageError> {
        Self::check_writable(user)?;
        let path = self.resolve(surl)?;
        if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::Duplication(format!("{} exists already", surl)));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        if let Some(size) = size
            && self.capacity.is_some_and(|capacity| size > capacity)
        {
            return Err(StorageError::NoFreeSpace(format!(
                "{} bytes exceed the storage capacity",
                size
            )));
        }

        let default_space_token = self.inherited_space_token(&path);
        let file_id = Uuid::new_v4().to_string();
        let staging = Self::staging_path(&path, &file_id);
        self.uploads.insert(
            file_id.clone(),
            Upload {
                surl: surl.to_string(),
                path,
                staging,
            },
        );
        debug!(surl, file_id = %file_id, "Upload prepared");
        Ok(PreparedUpload {
            file_id,
            default_space_token,
        })
    }

    async fn put_turl(
        &self,
        _user: &SrmUser,
        _surl: &str,
        file_id: &str,
        protocols: &[String],
    ) -> Result<String, StorageError> {
        Self::check_protocols(protocols)?;
        let upload = self.upload(file_id)?;
        Ok(file_turl(&upload.staging))
    }

    async fn put_done(
        &self,
        _user: &SrmUser,
        file_id: &str,
        surl: &str,
    ) -> Result<(), StorageError> {
        let upload = self.upload(file_id)?;
        if upload.surl != surl {
            return Err(StorageError::InvalidPath(format!(
                "upload {} is for {}",
                file_id, upload.surl
            )));
        }
        tokio::fs::rename(&upload.staging, &upload.path)
            .await
            .map_err(|e| io_error(&upload.staging, e))?;
        self.uploads.remove(file_id);
        info!(surl, "Upload completed");
        Ok(())
    }

    async fn abort_put(
        &self,
        _user: &SrmUser,
        file_id: &str,
        surl: &str,
        reason: &str,
    ) -> Result<(), StorageError> {
        let Some((_, upload)) = self.uploads.remove(file_id) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&upload.staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&upload.staging, e)),
        }
        debug!(surl, file_id, reason, "Upload aborted");
        Ok(())
    }

    async fn exists(&self, _user: &SrmUser, surl: &str) -> Result<bool, StorageError> {
        let staged = self
            .uploads
            .iter()
            .find(|entry| entry.value().surl == surl)
            .map(|entry| entry.value().staging.clone());
        let path = match staged {
            Some(staging) => staging,
            None => self.resolve(surl)?,
        };
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size_in_bytes: u64,
        lifetime: Duration,
        description: Option<String>,
    ) -> Result<Reservation, StorageError> {
        Self::check_writable(user)?;
        if let Some(capacity) = self.capacity {
            let free = capacity.saturating_sub(self.reserved_total());
            if size_in_bytes > free {
                return Err(StorageError::NoFreeSpace(format!(
                    "{} bytes requested, {} available",
                    size_in_bytes, free
                )));
            }
        }
        let token = Uuid::new_v4().to_string();
        self.spaces.insert(
            token.clone(),
            Space {
                owner: user.name.clone(),
                size_in_bytes,
                expires: expiry(lifetime),
                used: HashMap::new(),
            },
        );
        info!(
            token = %token,
            size = size_in_bytes,
            description = description.as_deref().unwrap_or(""),
            "Space reserved"
        );
        Ok(Reservation {
            token,
            size_in_bytes,
            lifetime,
        })
    }

    async fn release_space(&self, user: &SrmUser, token: &str) -> Result<(), StorageError> {
        match self
            .spaces
            .remove_if(token, |_, space| space.owner == user.name)
        {
            Some(_) => Ok(()),
            None if self.spaces.contains_key(token) => Err(StorageError::AuthorizationFailure(
                format!("space {} belongs to another user", token),
            )),
            None => Err(StorageError::SpaceReleased(token.to_string())),
        }
    }

    async fn mark_space_in_use(
        &self,
        _user: &SrmUser,
        token: &str,
        surl: &str,
        size_in_bytes: u64,
        lifetime: Duration,
    ) -> Result<(), StorageError> {
        let mut space = self
            .spaces
            .get_mut(token)
            .ok_or_else(|| StorageError::SpaceReleased(token.to_string()))?;
        if space.expires <= Utc::now() {
            return Err(StorageError::SpaceLifetimeExpired(token.to_string()));
        }
        if space.free() < size_in_bytes {
            return Err(StorageError::NoFreeSpace(format!(
                "{} bytes requested, {} free in {}",
                size_in_bytes,
                space.free(),
                token
            )));
        }
        space.used.insert(surl.to_string(), size_in_bytes);
        let wanted = expiry(lifetime);
        if wanted > space.expires {
            warn!(token, surl, "Space use outlives its reservation");
        }
        Ok(())
    }

    async fn unmark_space_in_use(
        &self,
        _user: &SrmUser,
        token: &str,
        surl: &str,
    ) -> Result<(), StorageError> {
        if let Some(mut space) = self.spaces.get_mut(token) {
            space.used.remove(surl);
        }
        Ok(())
    }

    async fn extend_reservation_lifetime(
        &self,
        _user: &SrmUser,
        token: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError> {
        let mut space = self
            .spaces
            .get_mut(token)
            .ok_or_else(|| StorageError::SpaceReleased(token.to_string()))?;
        let wanted = expiry(lifetime);
        if wanted > space.expires {
            space.expires = wanted;
        }
        Ok(to_duration(space.expires - Utc::now()))
    }

    async fn local_copy(
        &self,
        user: &SrmUser,
        from_surl: &str,
        to_file_id: &str,
    ) -> Result<(), StorageError> {
        Self::check_writable(user)?;
        let from = self.resolve(from_surl)?;
        let upload = self.upload(to_file_id)?;
        tokio::fs::copy(&from, &upload.staging)
            .await
            .map_err(|e| io_error(&from, e))?;
        Ok(())
    }

    async fn transfer(
        &self,
        user: &SrmUser,
        transfer_id: &str,
        direction: TransferDirection,
        _credential: Option<RequestCredential>,
    ) -> Result<(), StorageError> {
        let (from, to) = match direction {
            TransferDirection::Pull {
                remote_turl,
                file_id,
                ..
            } => {
                Self::check_writable(user)?;
                (turl_path(&remote_turl)?, self.upload(&file_id)?.staging)
            }
            TransferDirection::Push {
                local_surl,
                remote_turl,
            } => (self.resolve(&local_surl)?, turl_path(&remote_turl)?),
        };
        debug!(transfer_id, from = %from.display(), to = %to.display(), "Transfer started");
        self.run_transfer(transfer_id, from, to).await
    }

    async fn kill_transfer(&self, transfer_id: &str) -> Result<(), StorageError> {
        if let Some((_, handle)) = self.transfers.remove(transfer_id) {
            handle.abort();
            info!(transfer_id, "Transfer killed");
        }
        Ok(())
    }
}
