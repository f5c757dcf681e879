// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that expires jobs whose lifetime has passed.
//!
//! On every tick each live request is checked: READY and TRANSFERRING file
//! requests complete, anything else still running fails with "lifetime
//! expired". Expired requests whose file requests are all final are dropped
//! from the in-memory registry; they remain in persistence and are loaded
//! again on demand.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::context::SrmContext;
use crate::job::Job;

/// Configuration for the expiration checker.
#[derive(Debug, Clone)]
pub struct ExpirationCheckerConfig {
    /// How often to look for expired jobs.
    pub poll_interval: Duration,
}

impl Default for ExpirationCheckerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Periodically expires jobs in the live registry.
pub struct ExpirationChecker {
    ctx: SrmContext,
    config: ExpirationCheckerConfig,
    shutdown: Arc<Notify>,
}

impl ExpirationChecker {
    pub fn new(ctx: SrmContext, config: ExpirationCheckerConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the checker until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Expiration checker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Expiration checker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.check_all().await;
                }
            }
        }

        info!("Expiration checker stopped");
    }

    /// One pass over every live job.
    ///
    /// File requests are expired before their containers so a container
    /// converges on the final states of its children in the same pass.
    pub async fn check_all(&self) {
        let (containers, others): (Vec<Job>, Vec<Job>) = self
            .ctx
            .jobs
            .jobs()
            .into_iter()
            .partition(|job| matches!(job, Job::Container(_)));
        debug!(
            containers = containers.len(),
            jobs = others.len(),
            "Checking job lifetimes"
        );
        for job in others.iter().chain(containers.iter()) {
            job.check_expiration(&self.ctx).await;
        }

        let mut evicted = 0usize;
        for job in self.ctx.jobs.requests() {
            if self.is_evictable(&job).await {
                self.ctx.jobs.remove(&job.id());
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "Dropped finished requests from memory");
        }
    }

    async fn is_evictable(&self, job: &Job) -> bool {
        {
            let guard = job.lock().await;
            let data = guard.data();
            if !data.state().is_final() || !data.is_expired_at(Utc::now()) {
                return false;
            }
        }
        match job {
            Job::Container(container) => {
                for file in container.file_requests() {
                    if !file.state().await.is_final() {
                        return false;
                    }
                }
                true
            }
            _ => true,
        }
    }
}
