// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SRM request engine daemon.
//!
//! Runs the request lifecycle engine over SQLite persistence and the local
//! filesystem storage backend until interrupted. Jobs left active are
//! resumed on the next start.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use srm_core::config::Config;
use srm_core::persistence::SqlitePersistence;
use srm_core::runtime::SrmRuntime;
use srm_core::storage::LocalFsStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("srm_core=info".parse()?),
        )
        .init();

    info!("Starting SRM request engine");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database_url = %config.database_url,
        storage_root = %config.storage_root.display(),
        storage_host = %config.storage_host,
        thread_pool_size = config.thread_pool_size,
        max_in_progress = config.max_in_progress,
        "Configuration loaded"
    );

    let persistence = SqlitePersistence::from_url(&config.database_url, 5)
        .await?
        .with_history(config.request_history_enabled);
    info!("Database connection established, migrations applied");

    tokio::fs::create_dir_all(&config.storage_root).await?;
    let storage = LocalFsStorage::new(&config.storage_root, config.storage_host.clone());

    let runtime = SrmRuntime::builder()
        .config(config)
        .persistence(Arc::new(persistence))
        .storage(Arc::new(storage))
        .build()?
        .start()
        .await?;

    for line in runtime.scheduler_info() {
        info!("{}", line);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown().await?;

    Ok(())
}
