// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for srm-core.
//!
//! This module provides [`SrmRuntime`] which wires the engine together:
//! one scheduler per request family, recovery of the jobs that were active
//! when the process last stopped, and the expiration checker.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use srm_core::config::Config;
//! use srm_core::persistence::SqlitePersistence;
//! use srm_core::runtime::SrmRuntime;
//! use srm_core::storage::LocalFsStorage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let persistence = Arc::new(SqlitePersistence::from_url(&config.database_url, 5).await?);
//!     let storage = Arc::new(LocalFsStorage::new(&config.storage_root, "localhost"));
//!
//!     let runtime = SrmRuntime::builder()
//!         .config(config)
//!         .persistence(persistence)
//!         .storage(storage)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand runtime.handlers() to a protocol layer ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::SrmContext;
use crate::expiration::{ExpirationChecker, ExpirationCheckerConfig};
use crate::handlers::SrmHandlerState;
use crate::job::{Job, JobId, JobKind};
use crate::persistence::Persistence;
use crate::scheduler::{JobScheduler, JobSchedulerConfig, Scheduler};
use crate::storage::StorageBackend;

/// Scheduler ids and the job kinds each one runs.
const SCHEDULERS: &[(&str, &[JobKind])] = &[
    ("get", &[JobKind::GetFile]),
    ("put", &[JobKind::PutFile]),
    ("bring-online", &[JobKind::BringOnlineFile]),
    ("copy", &[JobKind::CopyFile]),
    ("reserve-space", &[JobKind::ReserveSpace]),
];

const CONTAINER_KINDS: &[JobKind] = &[
    JobKind::GetRequest,
    JobKind::PutRequest,
    JobKind::BringOnlineRequest,
    JobKind::CopyRequest,
];

const FILE_KINDS: &[JobKind] = &[
    JobKind::GetFile,
    JobKind::PutFile,
    JobKind::BringOnlineFile,
    JobKind::CopyFile,
];

/// Builder for creating a [`SrmRuntime`].
#[derive(Default)]
pub struct SrmRuntimeBuilder {
    config: Option<Config>,
    persistence: Option<Arc<dyn Persistence>>,
    storage: Option<Arc<dyn StorageBackend>>,
}

impl std::fmt::Debug for SrmRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrmRuntimeBuilder")
            .field("config", &self.config)
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .finish()
    }
}

impl SrmRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration. Default: [`Config::default`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the storage backend (required).
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<SrmRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;

        Ok(SrmRuntimeConfig {
            config: self.config.unwrap_or_default(),
            persistence,
            storage,
        })
    }
}

/// Configuration for a [`SrmRuntime`].
pub struct SrmRuntimeConfig {
    config: Config,
    persistence: Arc<dyn Persistence>,
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for SrmRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrmRuntimeConfig")
            .field("config", &self.config)
            .field("persistence", &"...")
            .field("storage", &"...")
            .finish()
    }
}

impl SrmRuntimeConfig {
    /// Start the runtime: register the schedulers, recover active jobs and
    /// spawn the expiration checker.
    pub async fn start(self) -> Result<SrmRuntime> {
        let expiration_config = ExpirationCheckerConfig {
            poll_interval: self.config.expiration_check_interval,
        };
        let scheduler_config = JobSchedulerConfig::from(&self.config);
        let ctx = SrmContext::new(self.config, self.persistence, self.storage);

        if !ctx.persistence.health_check().await? {
            anyhow::bail!("persistence health check failed");
        }

        let mut schedulers = Vec::with_capacity(SCHEDULERS.len());
        for (id, kinds) in SCHEDULERS {
            let scheduler = JobScheduler::new(*id, scheduler_config.clone(), ctx.clone());
            let as_dyn: Arc<dyn Scheduler> = scheduler.clone();
            ctx.schedulers.register(&as_dyn);
            for kind in *kinds {
                ctx.schedulers.assign(*kind, id);
            }
            schedulers.push(scheduler);
        }

        let restored = restore_active_jobs(&ctx).await?;

        let checker = ExpirationChecker::new(ctx.clone(), expiration_config);
        let expiration_shutdown = checker.shutdown_handle();
        let expiration_handle = tokio::spawn(async move { checker.run().await });

        info!(
            schedulers = schedulers.len(),
            restored_jobs = restored,
            "SrmRuntime started"
        );

        Ok(SrmRuntime {
            handlers: Arc::new(SrmHandlerState::new(ctx.clone())),
            ctx,
            schedulers,
            expiration_handle,
            expiration_shutdown,
        })
    }
}

/// Reload every job that was active when the process stopped and resume
/// it. Returns the number of jobs resumed.
async fn restore_active_jobs(ctx: &SrmContext) -> Result<usize> {
    let mut jobs: Vec<Job> = Vec::new();
    let mut seen: HashSet<JobId> = HashSet::new();

    for kind in FILE_KINDS {
        for record in ctx.persistence.get_active_jobs(*kind).await? {
            let Some(parent_id) = record.parent_id else {
                warn!(job_id = %record.id, "File request without a request, skipped");
                continue;
            };
            if let Err(e) = ctx.load_job(parent_id).await {
                error!(job_id = %record.id, request_id = %parent_id, error = %e, "Failed to restore request");
                continue;
            }
            if let Some(job) = ctx.jobs.get(&record.id)
                && seen.insert(record.id)
            {
                jobs.push(job);
            }
        }
    }
    for kind in CONTAINER_KINDS.iter().chain([JobKind::ReserveSpace].iter()) {
        for record in ctx.persistence.get_active_jobs(*kind).await? {
            match ctx.load_job(record.id).await {
                Ok(job) => {
                    if seen.insert(record.id) {
                        jobs.push(job);
                    }
                }
                Err(e) => error!(job_id = %record.id, error = %e, "Failed to restore job"),
            }
        }
    }

    // File requests first, so containers converge on their children's
    // recovered states.
    jobs.sort_by_key(|job| job.kind().is_container());
    let total = jobs.len();
    for job in jobs {
        if let Err(e) = job.on_restart(ctx).await {
            warn!(job_id = %job.id(), error = %e, "Failed to resume job after restart");
        }
    }
    if total > 0 {
        info!(jobs = total, "Restored active jobs");
    }
    Ok(total)
}

/// A running srm-core instance that can be embedded in an application.
///
/// The runtime manages:
/// - one [`JobScheduler`] per request family
/// - the periodic [`ExpirationChecker`]
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SrmRuntime {
    ctx: SrmContext,
    handlers: Arc<SrmHandlerState>,
    schedulers: Vec<Arc<JobScheduler>>,
    expiration_handle: JoinHandle<()>,
    expiration_shutdown: Arc<Notify>,
}

impl SrmRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SrmRuntimeBuilder {
        SrmRuntimeBuilder::new()
    }

    /// Shared collaborators of every job.
    pub fn context(&self) -> &SrmContext {
        &self.ctx
    }

    /// Handler state to pass to the functions in [`crate::handlers`].
    pub fn handlers(&self) -> &Arc<SrmHandlerState> {
        &self.handlers
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.ctx.persistence
    }

    pub fn schedulers(&self) -> &[Arc<JobScheduler>] {
        &self.schedulers
    }

    /// One status line per scheduler.
    pub fn scheduler_info(&self) -> Vec<String> {
        self.schedulers.iter().map(|scheduler| scheduler.info()).collect()
    }

    /// Ids of the most recently finished requests of `kind`, newest first.
    pub async fn latest_completed_requests(
        &self,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        Ok(self
            .ctx
            .persistence
            .get_latest_completed_job_ids(kind, limit)
            .await?)
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.expiration_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the expiration checker and the schedulers. Jobs keep their
    /// persisted states and are resumed by the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!("SrmRuntime shutting down...");

        self.expiration_shutdown.notify_one();
        for scheduler in &self.schedulers {
            scheduler.stop();
            self.ctx.schedulers.unregister(scheduler.id());
        }

        match self.expiration_handle.await {
            Ok(()) => {
                info!("SrmRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Expiration checker panicked: {}", e);
                Err(anyhow::anyhow!("expiration checker panicked: {}", e))
            }
        }
    }
}
