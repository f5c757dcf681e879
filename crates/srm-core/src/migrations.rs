// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for srm-core.
//!
//! Embedded migrations that can be run programmatically by products that
//! bring their own SQLite pool.
//!
//! ```ignore
//! let pool = SqlitePool::connect(&database_url).await?;
//! srm_core::migrations::run_sqlite(&pool).await?;
//! let persistence = SqlitePersistence::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
