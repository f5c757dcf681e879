// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request lifetimes: expiry of waiting and ready requests, eviction from
//! memory and reloading from persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use srm_core::expiration::{ExpirationChecker, ExpirationCheckerConfig};
use srm_core::job::{JobId, State};
use srm_core::request::{NewFile, RequestType};
use srm_core::status::StatusCode;

fn checker(env: &TestEnv) -> ExpirationChecker {
    ExpirationChecker::new(env.ctx().clone(), ExpirationCheckerConfig::default())
}

#[tokio::test]
async fn test_waiting_request_expires_and_is_evicted() {
    let env = TestEnv::new().await;
    env.storage.delay("pin_file", Duration::from_secs(3));
    let surl = env.write_file("tape/slow.tar", b"slow");

    let response = env
        .submit_with(
            RequestType::BringOnline,
            vec![NewFile::new(&surl)],
            file_options(),
            Some(Duration::from_secs(1)),
        )
        .await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::AsyncWait).await;
    let id: JobId = token.parse().unwrap();
    let file_id = env.status(&token).await.file_statuses[0].file_request_id;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    checker(&env).check_all().await;

    assert!(!env.ctx().jobs.contains(&id));
    assert!(!env.ctx().jobs.contains(&file_id));

    // Evicted requests are served from persistence.
    let response = env.status(&token).await;
    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    assert_eq!(file.status.code, StatusCode::Failure);
    assert!(
        file.status
            .explanation
            .as_deref()
            .unwrap_or_default()
            .contains("lifetime expired"),
        "{:?}",
        file.status
    );
    assert_eq!(response.status.code, StatusCode::Failure);
    assert!(env.ctx().jobs.contains(&id));
}

#[tokio::test]
async fn test_ready_request_expires_to_done() {
    let env = TestEnv::new().await;
    let surl = env.write_file("data/short.txt", b"short");

    let response = env
        .submit_with(
            RequestType::Get,
            vec![NewFile::new(&surl)],
            file_options(),
            Some(Duration::from_secs(2)),
        )
        .await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::Ready).await;

    tokio::time::sleep(Duration::from_millis(2200)).await;
    checker(&env).check_all().await;

    let response = env.status(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Done);
    assert_eq!(response.status.code, StatusCode::Success);
    assert!(env.wait_for_calls("unpin_file", 1).await);
}

#[tokio::test]
async fn test_live_requests_are_kept() {
    let env = TestEnv::new().await;
    let surl = env.write_file("tape/kept.tar", b"kept");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    env.wait_for_final(&token).await;
    let id: JobId = token.parse().unwrap();

    checker(&env).check_all().await;

    // Finished but not expired.
    assert!(env.ctx().jobs.contains(&id));
    let response = env.status(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Done);
    assert_eq!(response.status.code, StatusCode::Success);
}

#[tokio::test]
async fn test_periodic_checker() {
    let env = TestEnv::new().await;
    env.storage.delay("pin_file", Duration::from_secs(3));
    let surl = env.write_file("tape/periodic.tar", b"periodic");

    let response = env
        .submit_with(
            RequestType::BringOnline,
            vec![NewFile::new(&surl)],
            file_options(),
            Some(Duration::from_millis(500)),
        )
        .await;
    let token = response.request_token.unwrap();
    let id: JobId = token.parse().unwrap();

    let checker = Arc::new(ExpirationChecker::new(
        env.ctx().clone(),
        ExpirationCheckerConfig {
            poll_interval: Duration::from_millis(100),
        },
    ));
    let shutdown = checker.shutdown_handle();
    let task = tokio::spawn({
        let checker = checker.clone();
        async move { checker.run().await }
    });

    let jobs = &env.ctx().jobs;
    assert!(eventually(|| async { !jobs.contains(&id) }).await);

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("checker stops")
        .unwrap();
}
