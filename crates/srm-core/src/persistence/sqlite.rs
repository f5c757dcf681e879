// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::credential::RequestCredential;
use crate::error::SrmError;
use crate::job::{HistoryEvent, JobId, JobKind};
use crate::migrations;

use super::{JobRecord, Persistence};

const JOB_COLUMNS: &str = r#"
    id, kind, parent_id, state, creation_time, lifetime_millis, scheduler_id,
    scheduler_timestamp, priority, retries, max_retries, last_state_transition_time,
    status_code, error_message, payload
"#;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    parent_id: Option<String>,
    state: String,
    creation_time: DateTime<Utc>,
    lifetime_millis: i64,
    scheduler_id: Option<String>,
    scheduler_timestamp: i64,
    priority: i64,
    retries: i64,
    max_retries: i64,
    last_state_transition_time: DateTime<Utc>,
    status_code: Option<String>,
    error_message: String,
    payload: String,
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    history_id: i64,
    state: String,
    description: String,
    transition_time: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    id: String,
    owner: String,
    delegated: String,
    expiration: DateTime<Utc>,
}

fn decode_error(field: &str, value: &str) -> SrmError {
    SrmError::DatabaseError {
        operation: "decode".to_string(),
        details: format!("invalid {} '{}'", field, value),
    }
}

fn parse_id(value: &str) -> Result<JobId, SrmError> {
    value.parse().map_err(|_| decode_error("job id", value))
}

impl JobRow {
    fn into_record(self, history: Vec<HistoryRow>) -> Result<JobRecord, SrmError> {
        let history = history
            .into_iter()
            .map(|row| {
                Ok(HistoryEvent {
                    id: row.history_id as u64,
                    state: row
                        .state
                        .parse()
                        .map_err(|_| decode_error("state", &row.state))?,
                    description: row.description,
                    timestamp: row.transition_time,
                })
            })
            .collect::<Result<Vec<_>, SrmError>>()?;

        Ok(JobRecord {
            id: parse_id(&self.id)?,
            kind: self
                .kind
                .parse::<JobKind>()
                .map_err(|_| decode_error("kind", &self.kind))?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            state: self
                .state
                .parse()
                .map_err(|_| decode_error("state", &self.state))?,
            creation_time: self.creation_time,
            lifetime_millis: self.lifetime_millis,
            scheduler_id: self.scheduler_id,
            scheduler_timestamp: self.scheduler_timestamp,
            priority: self.priority as u32,
            retries: self.retries as u32,
            max_retries: self.max_retries as u32,
            last_state_transition_time: self.last_state_transition_time,
            status_code: self
                .status_code
                .as_deref()
                .map(|code| code.parse().map_err(|_| decode_error("status code", code)))
                .transpose()?,
            error_message: self.error_message,
            payload: serde_json::from_str(&self.payload)?,
            history,
        })
    }
}

/// SQLite-backed persistence provider.
///
/// Non-forced saves of jobs in a non-final state are skipped unless request
/// history logging is enabled; forced and final saves are always written.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    history_enabled: bool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            history_enabled: false,
        }
    }

    /// Also persist non-forced saves of non-final states.
    pub fn with_history(mut self, enabled: bool) -> Self {
        self.history_enabled = enabled;
        self
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/srm.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SrmError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| SrmError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::from_url(&url, 5).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn from_url(url: &str, max_connections: u32) -> Result<Self, SrmError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| SrmError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::SQLITE
            .run(&pool)
            .await
            .map_err(|e| SrmError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool))
    }

    /// Private in-memory database. One connection, so every query sees the
    /// same database.
    pub async fn in_memory() -> Result<Self, SrmError> {
        Self::from_url("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_history(&self, id: &str) -> Result<Vec<HistoryRow>, SrmError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT history_id, state, description, transition_time
            FROM job_history
            WHERE job_id = ?
            ORDER BY history_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn load_records(&self, rows: Vec<JobRow>) -> Result<Vec<JobRecord>, SrmError> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let history = self.load_history(&row.id).await?;
            records.push(row.into_record(history)?);
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn save_job(&self, record: &JobRecord, force: bool) -> Result<(), SrmError> {
        if !force && !self.history_enabled && !record.state.is_final() {
            return Ok(());
        }

        let id = record.id.to_string();
        let payload = serde_json::to_string(&record.payload)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, parent_id, state, creation_time, lifetime_millis, scheduler_id,
                scheduler_timestamp, priority, retries, max_retries, last_state_transition_time,
                status_code, error_message, payload, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                lifetime_millis = excluded.lifetime_millis,
                scheduler_id = excluded.scheduler_id,
                scheduler_timestamp = excluded.scheduler_timestamp,
                priority = excluded.priority,
                retries = excluded.retries,
                max_retries = excluded.max_retries,
                last_state_transition_time = excluded.last_state_transition_time,
                status_code = excluded.status_code,
                error_message = excluded.error_message,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&id)
        .bind(record.kind.as_str())
        .bind(record.parent_id.map(|p| p.to_string()))
        .bind(record.state.as_str())
        .bind(record.creation_time)
        .bind(record.lifetime_millis)
        .bind(&record.scheduler_id)
        .bind(record.scheduler_timestamp)
        .bind(record.priority as i64)
        .bind(record.retries as i64)
        .bind(record.max_retries as i64)
        .bind(record.last_state_transition_time)
        .bind(record.status_code.map(|code| code.as_str()))
        .bind(&record.error_message)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        for event in &record.history {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO job_history (job_id, history_id, state, description, transition_time)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(event.id as i64)
            .bind(event.state.as_str())
            .bind(&event.description)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, SrmError> {
        let query = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let history = self.load_history(&row.id).await?;
                Ok(Some(row.into_record(history)?))
            }
            None => Ok(None),
        }
    }

    async fn get_active_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, SrmError> {
        let query = format!(
            r#"
            SELECT {} FROM jobs
            WHERE kind = ? AND state NOT IN ('DONE', 'FAILED', 'CANCELED')
            ORDER BY rowid
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        self.load_records(rows).await
    }

    async fn get_jobs_by_parent(&self, parent_id: JobId) -> Result<Vec<JobRecord>, SrmError> {
        let query = format!(
            "SELECT {} FROM jobs WHERE parent_id = ? ORDER BY rowid",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        self.load_records(rows).await
    }

    async fn get_latest_completed_job_ids(
        &self,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobId>, SrmError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM jobs
            WHERE kind = ? AND state IN ('DONE', 'FAILED', 'CANCELED')
            ORDER BY last_state_transition_time DESC
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|(id,)| parse_id(id)).collect()
    }

    async fn save_credential(&self, credential: &RequestCredential) -> Result<(), SrmError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, owner, delegated, expiration, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (id) DO UPDATE SET
                owner = excluded.owner,
                delegated = excluded.delegated,
                expiration = excluded.expiration,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.owner)
        .bind(&credential.delegated)
        .bind(credential.expiration)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<RequestCredential>, SrmError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, owner, delegated, expiration
            FROM credentials
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RequestCredential {
            id: row.id,
            owner: row.owner,
            delegated: row.delegated,
            expiration: row.expiration,
        }))
    }

    async fn health_check(&self) -> Result<bool, SrmError> {
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
