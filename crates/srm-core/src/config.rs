// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which space failure wins when a request has children reporting both
/// `SRM_NO_FREE_SPACE` and `SRM_SPACE_LIFETIME_EXPIRED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpacePrecedence {
    /// Report `SRM_NO_FREE_SPACE` first.
    #[default]
    NoFreeSpace,
    /// Report `SRM_SPACE_LIFETIME_EXPIRED` first.
    SpaceLifetimeExpired,
}

impl FromStr for SpacePrecedence {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-free-space" => Ok(Self::NoFreeSpace),
            "space-lifetime-expired" => Ok(Self::SpaceLifetimeExpired),
            _ => Err(()),
        }
    }
}

/// srm-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Root directory of the local storage backend
    pub storage_root: PathBuf,
    /// Host name in the SURLs the local storage backend serves
    pub storage_host: String,
    /// Retries before a non-fatal failure fails the job
    pub max_retries: u32,
    /// Delay before a RETRYWAIT job is rescheduled
    pub retry_timeout: Duration,
    /// Maximum number of jobs a scheduler accepts
    pub max_requests: usize,
    /// Maximum in-progress jobs per scheduler
    pub max_in_progress: usize,
    /// Maximum READY jobs per scheduler
    pub max_ready_jobs: usize,
    /// Concurrent `run` invocations per scheduler
    pub thread_pool_size: usize,
    /// Reserve space implicitly for uploads without a space token
    pub reserve_space_implicitly: bool,
    /// Period of the expiration checker
    pub expiration_check_interval: Duration,
    /// Timeout applied to every storage backend call
    pub storage_timeout: Duration,
    /// How long status aggregation waits for a child's lock
    pub status_lock_timeout: Duration,
    /// Ceiling of the estimated-wait hint returned to clients
    pub max_update_period: Duration,
    /// Maximum number of cached credentials
    pub credential_cache_size: usize,
    /// Time-to-live of cached credentials
    pub credential_cache_ttl: Duration,
    /// Space failure precedence during status aggregation
    pub space_precedence: SpacePrecedence,
    /// Persist every state change, not only forced and final saves
    pub request_history_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:.data/srm.db?mode=rwc".to_string(),
            storage_root: PathBuf::from(".data/storage"),
            storage_host: "localhost".to_string(),
            max_retries: 10,
            retry_timeout: Duration::from_millis(60_000),
            max_requests: 10_000,
            max_in_progress: 100,
            max_ready_jobs: 1_000,
            thread_pool_size: 30,
            reserve_space_implicitly: true,
            expiration_check_interval: Duration::from_secs(60),
            storage_timeout: Duration::from_secs(300),
            status_lock_timeout: Duration::from_millis(5_000),
            max_update_period: Duration::from_secs(600),
            credential_cache_size: 1_000,
            credential_cache_ttl: Duration::from_secs(600),
            space_precedence: SpacePrecedence::NoFreeSpace,
            request_history_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; see [`Config::default`] for the defaults.
    /// - `SRM_DATABASE_URL`, `SRM_STORAGE_ROOT`, `SRM_HOST`
    /// - `SRM_MAX_RETRIES`, `SRM_RETRY_TIMEOUT_MS`
    /// - `SRM_MAX_REQUESTS`, `SRM_MAX_IN_PROGRESS`, `SRM_MAX_READY_JOBS`,
    ///   `SRM_THREAD_POOL_SIZE`
    /// - `SRM_RESERVE_SPACE_IMPLICITLY`
    /// - `SRM_EXPIRATION_CHECK_INTERVAL_SECS`, `SRM_STORAGE_TIMEOUT_SECS`,
    ///   `SRM_STATUS_LOCK_TIMEOUT_MS`, `SRM_MAX_UPDATE_PERIOD_SECS`
    /// - `SRM_CREDENTIAL_CACHE_SIZE`, `SRM_CREDENTIAL_CACHE_TTL_SECS`
    /// - `SRM_SPACE_PRECEDENCE`: `no-free-space` or `space-lifetime-expired`
    /// - `SRM_REQUEST_HISTORY_ENABLED`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let database_url =
            std::env::var("SRM_DATABASE_URL").unwrap_or(defaults.database_url);
        let storage_root = std::env::var("SRM_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);
        let storage_host = match std::env::var("SRM_HOST") {
            Ok(host) if host.trim().is_empty() => {
                return Err(ConfigError::Invalid("SRM_HOST", "must not be empty"));
            }
            Ok(host) => host.trim().to_string(),
            Err(_) => defaults.storage_host,
        };

        let max_retries = parse_var(
            "SRM_MAX_RETRIES",
            defaults.max_retries,
            "must be a non-negative integer",
        )?;
        let retry_timeout_ms: u64 = parse_var(
            "SRM_RETRY_TIMEOUT_MS",
            60_000,
            "must be a number of milliseconds",
        )?;
        let max_requests = positive(
            "SRM_MAX_REQUESTS",
            parse_var(
                "SRM_MAX_REQUESTS",
                defaults.max_requests,
                "must be a positive integer",
            )?,
        )?;
        let max_in_progress = positive(
            "SRM_MAX_IN_PROGRESS",
            parse_var(
                "SRM_MAX_IN_PROGRESS",
                defaults.max_in_progress,
                "must be a positive integer",
            )?,
        )?;
        let max_ready_jobs = positive(
            "SRM_MAX_READY_JOBS",
            parse_var(
                "SRM_MAX_READY_JOBS",
                defaults.max_ready_jobs,
                "must be a positive integer",
            )?,
        )?;
        let thread_pool_size = positive(
            "SRM_THREAD_POOL_SIZE",
            parse_var(
                "SRM_THREAD_POOL_SIZE",
                defaults.thread_pool_size,
                "must be a positive integer",
            )?,
        )?;
        let reserve_space_implicitly = parse_var(
            "SRM_RESERVE_SPACE_IMPLICITLY",
            defaults.reserve_space_implicitly,
            "must be true or false",
        )?;
        let expiration_check_secs: u64 = parse_var(
            "SRM_EXPIRATION_CHECK_INTERVAL_SECS",
            60,
            "must be a number of seconds",
        )?;
        let storage_timeout_secs: u64 =
            parse_var("SRM_STORAGE_TIMEOUT_SECS", 300, "must be a number of seconds")?;
        let status_lock_timeout_ms: u64 = parse_var(
            "SRM_STATUS_LOCK_TIMEOUT_MS",
            5_000,
            "must be a number of milliseconds",
        )?;
        let max_update_period_secs: u64 = parse_var(
            "SRM_MAX_UPDATE_PERIOD_SECS",
            600,
            "must be a number of seconds",
        )?;
        let credential_cache_size = parse_var(
            "SRM_CREDENTIAL_CACHE_SIZE",
            defaults.credential_cache_size,
            "must be a non-negative integer",
        )?;
        let credential_cache_ttl_secs: u64 = parse_var(
            "SRM_CREDENTIAL_CACHE_TTL_SECS",
            600,
            "must be a number of seconds",
        )?;
        let space_precedence = parse_var(
            "SRM_SPACE_PRECEDENCE",
            defaults.space_precedence,
            "must be no-free-space or space-lifetime-expired",
        )?;
        let request_history_enabled = parse_var(
            "SRM_REQUEST_HISTORY_ENABLED",
            defaults.request_history_enabled,
            "must be true or false",
        )?;

        if expiration_check_secs == 0 {
            return Err(ConfigError::Invalid(
                "SRM_EXPIRATION_CHECK_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            database_url,
            storage_root,
            storage_host,
            max_retries,
            retry_timeout: Duration::from_millis(retry_timeout_ms),
            max_requests,
            max_in_progress,
            max_ready_jobs,
            thread_pool_size,
            reserve_space_implicitly,
            expiration_check_interval: Duration::from_secs(expiration_check_secs),
            storage_timeout: Duration::from_secs(storage_timeout_secs),
            status_lock_timeout: Duration::from_millis(status_lock_timeout_ms),
            max_update_period: Duration::from_secs(max_update_period_secs),
            credential_cache_size,
            credential_cache_ttl: Duration::from_secs(credential_cache_ttl_secs),
            space_precedence,
            request_history_enabled,
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn positive(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(name, "must be greater than zero"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
