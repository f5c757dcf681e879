// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Download and bring-online requests: pinning, TURLs, release and lifetime
//! extension.

mod common;

use std::time::Duration;

use common::*;
use srm_core::error::SrmError;
use srm_core::handlers::{self, AbortRequest, ExtendFileLifetimeRequest, FilesRequest};
use srm_core::job::State;
use srm_core::request::{NewFile, RequestType};
use srm_core::status::StatusCode;

async fn release(env: &TestEnv, token: &str, surls: &[&str]) -> handlers::FilesResponse {
    handlers::release_files(
        env.handlers(),
        FilesRequest {
            request_token: token.to_string(),
            surls: surls.iter().map(|surl| surl.to_string()).collect(),
        },
    )
    .await
}

#[tokio::test]
async fn test_get_lifecycle() {
    let env = TestEnv::new().await;
    let surl = env.write_file("data/file.txt", b"contents");

    let response = env.submit(RequestType::Get, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_all(&token, State::Ready).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.status.code, StatusCode::FilePinned);
    assert_eq!(file.size, Some(8));
    let turl = file.turl.clone().expect("TURL of a ready download");
    assert_eq!(std::fs::read(turl_path(&turl)).unwrap(), b"contents");
    assert_eq!(response.status.code, StatusCode::Success);

    let released = release(&env, &token, &[&surl]).await;
    assert_eq!(released.status.code, StatusCode::Success);

    let response = env.status(&token).await;
    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Done);
    assert_eq!(file.status.code, StatusCode::Released);
    assert!(file.turl.is_none());
    assert_eq!(response.status.code, StatusCode::Success);
    assert!(env.wait_for_calls("unpin_file", 1).await);
}

#[tokio::test]
async fn test_get_missing_file() {
    let env = TestEnv::new().await;
    let surl = env.surl("data/missing.txt");

    let response = env.submit(RequestType::Get, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    assert_eq!(file.status.code, StatusCode::InvalidPath);
    assert_eq!(response.status.code, StatusCode::Failure);
    assert_eq!(env.storage.calls("pin_file"), 0);
}

#[tokio::test]
async fn test_get_of_file_being_uploaded_is_busy() {
    let env = TestEnv::new().await;
    let surl = env.surl("data/uploading.txt");

    let upload = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let upload_token = upload.request_token.unwrap();
    env.wait_for_all(&upload_token, State::Ready).await;

    let response = env.submit(RequestType::Get, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;
    assert_eq!(response.file_statuses[0].status.code, StatusCode::FileBusy);
}

#[tokio::test]
async fn test_extend_file_lifetime_extends_the_pin() {
    let env = TestEnv::new().await;
    let surl = env.write_file("data/long.txt", b"x");

    let response = env.submit(RequestType::Get, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::Ready).await;

    let extended = handlers::extend_file_lifetime(
        env.handlers(),
        ExtendFileLifetimeRequest {
            request_token: token.clone(),
            surls: vec![surl.clone()],
            new_lifetime: Duration::from_secs(8 * 3600),
        },
    )
    .await;
    assert_eq!(extended.status.code, StatusCode::Success);
    assert_eq!(extended.files[0].lifetime_secs, Some(28_800));
    assert_eq!(env.storage.calls("extend_pin_lifetime"), 1);

    // The request lives at least as long as its files.
    let response = env.status(&token).await;
    assert!(response.remaining_lifetime_secs.unwrap() > 4 * 3600);
    assert!(response.file_statuses[0].remaining_lifetime_secs > 4 * 3600);
}

#[tokio::test]
async fn test_bring_online_and_release() {
    let env = TestEnv::new().await;
    let surl = env.write_file("tape/archive.tar", b"archive");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Done);
    assert_eq!(file.status.code, StatusCode::Success);
    assert!(file.turl.is_none());
    assert_eq!(response.status.code, StatusCode::Success);

    let released = release(&env, &token, &[]).await;
    assert_eq!(released.status.code, StatusCode::Success);
    assert_eq!(env.storage.calls("unpin_file"), 1);

    let again = release(&env, &token, &[]).await;
    assert_eq!(again.files[0].status.code, StatusCode::Failure);
    assert_eq!(
        again.files[0].status.explanation.as_deref(),
        Some("SURL is not pinned")
    );
    assert_eq!(env.storage.calls("unpin_file"), 1);
}

#[tokio::test]
async fn test_abort_while_pinning() {
    let env = TestEnv::new().await;
    env.storage.delay("pin_file", Duration::from_millis(500));
    let surl = env.write_file("tape/slow.tar", b"slow");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::AsyncWait).await;

    let aborted = handlers::abort_request(
        env.handlers(),
        AbortRequest {
            request_token: token.clone(),
            reason: "not needed".to_string(),
        },
    )
    .await;
    assert_eq!(aborted.code, StatusCode::Success);

    let response = env.status(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Canceled);
    assert_eq!(response.file_statuses[0].status.code, StatusCode::Aborted);
    assert_eq!(response.status.code, StatusCode::Aborted);

    // The late pin does not revive the request.
    assert!(env.wait_for_calls("pin_file", 1).await);
    tokio::time::sleep(Duration::from_millis(700)).await;
    let response = env.status(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Canceled);
}

#[tokio::test]
async fn test_release_of_upload_is_not_supported() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/put.dat");

    let response = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::Ready).await;

    let released = release(&env, &token, &[&surl]).await;
    assert_eq!(released.status.code, StatusCode::NotSupported);
    assert!(released.files.is_empty());
}

#[tokio::test]
async fn test_extend_lifetime_of_finished_files() {
    let env = TestEnv::new().await;
    let done = env.write_file("tape/done.tar", b"done");
    let slow = env.write_file("tape/slow.tar", b"slow");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&done)])
        .await;
    let done_token = response.request_token.unwrap();
    env.wait_for_final(&done_token).await;

    env.storage.delay("pin_file", Duration::from_millis(500));
    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&slow)])
        .await;
    let canceled_token = response.request_token.unwrap();
    env.wait_for_all(&canceled_token, State::AsyncWait).await;
    handlers::abort_request(
        env.handlers(),
        AbortRequest {
            request_token: canceled_token.clone(),
            reason: "not needed".to_string(),
        },
    )
    .await;

    let hour = Duration::from_secs(3600).as_millis() as i64;
    let container = env.ctx().jobs.container(&done_token.parse().unwrap()).unwrap();
    let err = container
        .extend_file_lifetime(env.ctx(), &done, hour)
        .await
        .unwrap_err();
    assert!(matches!(err, SrmError::Released { .. }), "{:?}", err);

    let container = env
        .ctx()
        .jobs
        .container(&canceled_token.parse().unwrap())
        .unwrap();
    let err = container
        .extend_file_lifetime(env.ctx(), &slow, hour)
        .await
        .unwrap_err();
    assert!(matches!(err, SrmError::Aborted { .. }), "{:?}", err);

    let extended = handlers::extend_file_lifetime(
        env.handlers(),
        ExtendFileLifetimeRequest {
            request_token: done_token,
            surls: vec![done.clone()],
            new_lifetime: Duration::from_secs(3600),
        },
    )
    .await;
    assert_eq!(extended.files[0].status.code, StatusCode::Released);
    assert_eq!(extended.files[0].lifetime_secs, None);
}
