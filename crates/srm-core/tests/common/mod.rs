// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for srm-core integration tests.
//!
//! Provides [`TestEnv`], a started runtime over a temporary storage root, and
//! [`ScriptedStorage`], a local storage whose calls can be delayed or made
//! to fail on demand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tempfile::TempDir;

use srm_core::config::Config;
use srm_core::context::SrmContext;
use srm_core::credential::RequestCredential;
use srm_core::file_request::FileStatus;
use srm_core::handlers::{self, RequestStatusResponse, StatusQuery, SubmitRequest};
use srm_core::job::{JobId, State};
use srm_core::persistence::{MemoryPersistence, Persistence};
use srm_core::request::{NewFile, RequestData, RequestOptions, RequestType, SrmUser};
use srm_core::runtime::SrmRuntime;
use srm_core::storage::{
    FileMetadata, LocalFsStorage, PinnedFile, PreparedUpload, Reservation, StorageBackend,
    StorageError, TransferDirection,
};

pub const HOST: &str = "localhost";
pub const USER: &str = "alice";

/// How long tests wait for asynchronous progress before giving up.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("srm_core=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with short delays, suitable for tests.
pub fn test_config() -> Config {
    Config {
        max_retries: 3,
        retry_timeout: Duration::from_millis(50),
        storage_timeout: Duration::from_secs(5),
        status_lock_timeout: Duration::from_secs(1),
        expiration_check_interval: Duration::from_secs(3600),
        max_update_period: Duration::from_secs(10),
        ..Config::default()
    }
}

pub fn request_data() -> RequestData {
    RequestData::new(SrmUser::new(USER), "test-client")
}

pub fn file_options() -> RequestOptions {
    RequestOptions {
        protocols: vec!["file".to_string()],
        ..RequestOptions::default()
    }
}

/// Local path of a `file://` TURL.
pub fn turl_path(turl: &str) -> PathBuf {
    PathBuf::from(turl.strip_prefix("file://").expect("file TURL"))
}

/// Poll `check` until it holds or [`WAIT`] passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Scripted storage
// ============================================================================

/// [`LocalFsStorage`] with per-operation call counters, delays and queued
/// failures.
pub struct ScriptedStorage {
    inner: LocalFsStorage,
    calls: DashMap<&'static str, usize>,
    delays: DashMap<&'static str, Duration>,
    failures: DashMap<&'static str, VecDeque<StorageError>>,
}

impl ScriptedStorage {
    pub fn new(inner: LocalFsStorage) -> Self {
        Self {
            inner,
            calls: DashMap::new(),
            delays: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &LocalFsStorage {
        &self.inner
    }

    /// Fail the next call of `op` with `err`. Failures queue up.
    pub fn fail_next(&self, op: &'static str, err: StorageError) {
        self.failures.entry(op).or_default().push_back(err);
    }

    /// Delay every call of `op`.
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.delays.insert(op, delay);
    }

    pub fn clear_delay(&self, op: &'static str) {
        self.delays.remove(op);
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.get(op).map(|count| *count).unwrap_or(0)
    }

    async fn enter(&self, op: &'static str) -> Result<(), StorageError> {
        *self.calls.entry(op).or_insert(0) += 1;
        let delay = self.delays.get(op).map(|delay| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .failures
            .get_mut(op)
            .and_then(|mut queue| queue.pop_front());
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for ScriptedStorage {
    fn supported_get_protocols(&self) -> Vec<String> {
        self.inner.supported_get_protocols()
    }

    fn supported_put_protocols(&self) -> Vec<String> {
        self.inner.supported_put_protocols()
    }

    fn is_local_surl(&self, surl: &str) -> bool {
        self.inner.is_local_surl(surl)
    }

    async fn get_file_info(
        &self,
        user: &SrmUser,
        surl: &str,
    ) -> Result<FileMetadata, StorageError> {
        self.enter("get_file_info").await?;
        self.inner.get_file_info(user, surl).await
    }

    async fn pin_file(
        &self,
        user: &SrmUser,
        surl: &str,
        lifetime: Duration,
        request_id: JobId,
    ) -> Result<PinnedFile, StorageError> {
        self.enter("pin_file").await?;
        self.inner.pin_file(user, surl, lifetime, request_id).await
    }

    async fn unpin_file(
        &self,
        user: &SrmUser,
        file_id: &str,
        pin_id: &str,
    ) -> Result<(), StorageError> {
        self.enter("unpin_file").await?;
        self.inner.unpin_file(user, file_id, pin_id).await
    }

    async fn extend_pin_lifetime(
        &self,
        user: &SrmUser,
        file_id: &str,
        pin_id: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError> {
        self.enter("extend_pin_lifetime").await?;
        self.inner
            .extend_pin_lifetime(user, file_id, pin_id, lifetime)
            .await
    }

    async fn get_turl(
        &self,
        user: &SrmUser,
        surl: &str,
        protocols: &[String],
    ) -> Result<String, StorageError> {
        self.enter("get_turl").await?;
        self.inner.get_turl(user, surl, protocols).await
    }

    async fn prepare_to_put(
        &self,
        user: &SrmUser,
        surl: &str,
        size: Option<u64>,
        overwrite: bool,
    ) -> Result<PreparedUpload, StorageError> {
        self.enter("prepare_to_put").await?;
        self.inner.prepare_to_put(user, surl, size, overwrite).await
    }

    async fn put_turl(
        &self,
        user: &SrmUser,
        surl: &str,
        file_id: &str,
        protocols: &[String],
    ) -> Result<String, StorageError> {
        self.enter("put_turl").await?;
        self.inner.put_turl(user, surl, file_id, protocols).await
    }

    async fn put_done(
        &self,
        user: &SrmUser,
        file_id: &str,
        surl: &str,
    ) -> Result<(), StorageError> {
        self.enter("put_done").await?;
        self.inner.put_done(user, file_id, surl).await
    }

    async fn abort_put(
        &self,
        user: &SrmUser,
        file_id: &str,
        surl: &str,
        reason: &str,
    ) -> Result<(), StorageError> {
        self.enter("abort_put").await?;
        self.inner.abort_put(user, file_id, surl, reason).await
    }

    async fn exists(&self, user: &SrmUser, surl: &str) -> Result<bool, StorageError> {
        self.enter("exists").await?;
        self.inner.exists(user, surl).await
    }

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size_in_bytes: u64,
        lifetime: Duration,
        description: Option<String>,
    ) -> Result<Reservation, StorageError> {
        self.enter("reserve_space").await?;
        self.inner
            .reserve_space(user, size_in_bytes, lifetime, description)
            .await
    }

    async fn release_space(&self, user: &SrmUser, token: &str) -> Result<(), StorageError> {
        self.enter("release_space").await?;
        self.inner.release_space(user, token).await
    }

    async fn mark_space_in_use(
        &self,
        user: &SrmUser,
        token: &str,
        surl: &str,
        size_in_bytes: u64,
        lifetime: Duration,
    ) -> Result<(), StorageError> {
        self.enter("mark_space_in_use").await?;
        self.inner
            .mark_space_in_use(user, token, surl, size_in_bytes, lifetime)
            .await
    }

    async fn unmark_space_in_use(
        &self,
        user: &SrmUser,
        token: &str,
        surl: &str,
    ) -> Result<(), StorageError> {
        self.enter("unmark_space_in_use").await?;
        self.inner.unmark_space_in_use(user, token, surl).await
    }

    async fn extend_reservation_lifetime(
        &self,
        user: &SrmUser,
        token: &str,
        lifetime: Duration,
    ) -> Result<Duration, StorageError> {
        self.enter("extend_reservation_lifetime").await?;
        self.inner
            .extend_reservation_lifetime(user, token, lifetime)
            .await
    }

    async fn local_copy(
        &self,
        user: &SrmUser,
        from_surl: &str,
        to_file_id: &str,
    ) -> Result<(), StorageError> {
        self.enter("local_copy").await?;
        self.inner.local_copy(user, from_surl, to_file_id).await
    }

    async fn transfer(
        &self,
        user: &SrmUser,
        transfer_id: &str,
        direction: TransferDirection,
        credential: Option<RequestCredential>,
    ) -> Result<(), StorageError> {
        self.enter("transfer").await?;
        self.inner
            .transfer(user, transfer_id, direction, credential)
            .await
    }

    async fn kill_transfer(&self, transfer_id: &str) -> Result<(), StorageError> {
        *self.calls.entry("kill_transfer").or_insert(0) += 1;
        self.inner.kill_transfer(transfer_id).await
    }
}

// ============================================================================
// Test environment
// ============================================================================

/// A started runtime over a temporary storage root.
pub struct TestEnv {
    pub dir: TempDir,
    pub storage: Arc<ScriptedStorage>,
    pub persistence: Arc<dyn Persistence>,
    pub runtime: SrmRuntime,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(config, |storage| storage).await
    }

    /// Environment whose local storage is adjusted by `customize`, e.g. to
    /// limit its capacity.
    pub async fn build(
        config: Config,
        customize: impl FnOnce(LocalFsStorage) -> LocalFsStorage,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let storage = Arc::new(ScriptedStorage::new(customize(LocalFsStorage::new(
            dir.path().join("storage"),
            HOST,
        ))));
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let runtime = start_runtime(config, persistence.clone(), storage.clone()).await;
        Self {
            dir,
            storage,
            persistence,
            runtime,
        }
    }

    pub fn ctx(&self) -> &SrmContext {
        self.runtime.context()
    }

    pub fn handlers(&self) -> &handlers::SrmHandlerState {
        self.runtime.handlers()
    }

    pub fn surl(&self, path: &str) -> String {
        format!("srm://{}/{}", HOST, path)
    }

    /// Path of a file in the storage root.
    pub fn path(&self, path: &str) -> PathBuf {
        self.dir.path().join("storage").join(path)
    }

    /// Create a file in the storage root.
    pub fn write_file(&self, path: &str, contents: &[u8]) -> String {
        write_file(&self.path(path), contents);
        self.surl(path)
    }

    /// Path outside the storage root, standing in for a remote site.
    pub fn remote_path(&self, path: &str) -> PathBuf {
        self.dir.path().join("remote").join(path)
    }

    pub async fn submit(
        &self,
        request_type: RequestType,
        files: Vec<NewFile>,
    ) -> RequestStatusResponse {
        self.submit_with(request_type, files, file_options(), None)
            .await
    }

    pub async fn submit_with(
        &self,
        request_type: RequestType,
        files: Vec<NewFile>,
        options: RequestOptions,
        lifetime: Option<Duration>,
    ) -> RequestStatusResponse {
        let response = handlers::submit_container_request(
            self.handlers(),
            SubmitRequest {
                request_type,
                request: request_data(),
                options,
                files,
                lifetime,
            },
        )
        .await;
        assert!(
            response.request_token.is_some(),
            "request rejected: {}",
            response.status
        );
        response
    }

    pub async fn status(&self, token: &str) -> RequestStatusResponse {
        handlers::get_request_status(
            self.handlers(),
            StatusQuery {
                request_token: token.to_string(),
                surls: Vec::new(),
                wait: None,
            },
        )
        .await
    }

    /// Poll the request until its file statuses satisfy `done`.
    pub async fn wait_for_files(
        &self,
        token: &str,
        done: impl Fn(&[FileStatus]) -> bool,
    ) -> RequestStatusResponse {
        let done = &done;
        let reached = eventually(move || async move {
            done(&self.status(token).await.file_statuses)
        })
        .await;
        let response = self.status(token).await;
        assert!(reached, "request {} did not progress: {:#?}", token, response);
        response
    }

    /// Poll the request until every file is in `state`.
    pub async fn wait_for_all(&self, token: &str, state: State) -> RequestStatusResponse {
        self.wait_for_files(token, |files| files.iter().all(|file| file.state == state))
            .await
    }

    /// Poll the request until every file is in a final state.
    pub async fn wait_for_final(&self, token: &str) -> RequestStatusResponse {
        self.wait_for_files(token, |files| {
            files.iter().all(|file| file.state.is_final())
        })
        .await
    }

    /// Wait until the storage has seen at least `count` calls of `op`.
    pub async fn wait_for_calls(&self, op: &'static str, count: usize) -> bool {
        let storage = &self.storage;
        eventually(move || async move { storage.calls(op) >= count }).await
    }

    /// History of a live file request.
    pub async fn file_history(&self, id: JobId) -> Vec<State> {
        let file = self.ctx().jobs.file_request(&id).expect("live file request");
        let guard = file.lock().await;
        guard
            .data()
            .history()
            .iter()
            .map(|event| event.state)
            .collect()
    }
}

pub async fn start_runtime(
    config: Config,
    persistence: Arc<dyn Persistence>,
    storage: Arc<dyn StorageBackend>,
) -> SrmRuntime {
    SrmRuntime::builder()
        .config(config)
        .persistence(persistence)
        .storage(storage)
        .build()
        .expect("runtime config")
        .start()
        .await
        .expect("runtime start")
}

pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}
