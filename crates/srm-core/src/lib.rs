// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SRM Core - Request Lifecycle Engine for a Storage Resource Manager
//!
//! This crate tracks every client-issued storage operation (bring-online,
//! download, upload, copy, space reservation) from submission to
//! completion. It drives the asynchronous storage operations each request
//! needs (pins, space reservations, transfers) and reports aggregate status
//! to a protocol layer.
//!
//! # Architecture
//!
//! ```text
//!  protocol layer ──► handlers ──► ContainerRequest ──► FileRequest (get/put/bring-online/copy)
//!                                        │                    │
//!                                        │ lazy status        │ run() on a scheduler worker
//!                                        ▼                    ▼
//!                                 aggregate_status      StorageBackend call ─► Completion
//!                                                             │                    │
//!                                                             └──── by job id ◄────┘
//! ```
//!
//! # Jobs
//!
//! Every request and file request is a job with a fixed state machine:
//!
//! | State | Meaning |
//! |-------|---------|
//! | `PENDING` | Created, not yet scheduled |
//! | `TQUEUED` / `PRIORITYTQUEUED` | Waiting for a scheduler worker |
//! | `RUNNING` | `run` is executing |
//! | `ASYNCWAIT` | Waiting for a storage backend call to complete |
//! | `RETRYWAIT` | Waiting to be retried after a transient failure |
//! | `RQUEUED` / `READY` | Waiting for a ready slot / TURL handed to the client |
//! | `TRANSFERRING` | Client is transferring data |
//! | `RESTORED` | Recovered after a restart |
//! | `DONE` / `FAILED` / `CANCELED` | Final |
//!
//! State changes go through [`job::set_state`], which validates the
//! transition, records history, notifies the scheduler, runs the kind's
//! final-state compensation and persists the job.
//!
//! # Status aggregation
//!
//! A container request's status is computed on demand from its file
//! requests' statuses by [`container::aggregate_status`].
//!
//! # Modules
//!
//! - [`runtime`]: embeddable runtime (schedulers, restart recovery, expiration)
//! - [`handlers`]: protocol-neutral operations
//! - [`persistence`]: job persistence (SQLite, in-memory)
//! - [`storage`]: storage backend contract and local filesystem backend
//! - [`scheduler`]: scheduler contract and queue scheduler

pub mod callbacks;
pub mod config;
pub mod container;
pub mod context;
pub mod credential;
pub mod error;
pub mod expiration;
pub mod file_request;
pub mod handlers;
pub mod job;
pub mod migrations;
pub mod persistence;
pub mod registry;
pub mod request;
pub mod reserve_space;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod storage;

pub use error::{Result, SrmError};
