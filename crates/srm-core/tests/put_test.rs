// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload requests: TURL hand-out, put-done, space accounting and upload
//! conflicts.

mod common;

use std::time::Duration;

use common::*;
use srm_core::handlers::{self, AbortRequest, FilesRequest, ReserveSpaceSubmit};
use srm_core::job::State;
use srm_core::request::{NewFile, RequestOptions, RequestType};
use srm_core::status::StatusCode;

async fn put_done(env: &TestEnv, token: &str, surls: &[&str]) -> handlers::FilesResponse {
    handlers::put_done(
        env.handlers(),
        FilesRequest {
            request_token: token.to_string(),
            surls: surls.iter().map(|surl| surl.to_string()).collect(),
        },
    )
    .await
}

#[tokio::test]
async fn test_put_lifecycle() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/new.dat");

    let response = env
        .submit(RequestType::Put, vec![NewFile::new(&surl).with_size(5)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_all(&token, State::Ready).await;
    let file = &response.file_statuses[0];
    assert_eq!(file.status.code, StatusCode::SpaceAvailable);
    assert_eq!(response.status.code, StatusCode::Success);

    // The client writes to the TURL, not to the final path.
    let turl = file.turl.clone().expect("TURL of a ready upload");
    write_file(&turl_path(&turl), b"hello");
    assert!(!env.path("incoming/new.dat").exists());

    let done = put_done(&env, &token, &[&surl]).await;
    assert_eq!(done.status.code, StatusCode::Success);
    assert_eq!(done.files[0].status.code, StatusCode::Success);

    let response = env.wait_for_all(&token, State::Done).await;
    assert_eq!(response.file_statuses[0].status.code, StatusCode::Success);
    assert_eq!(response.status.code, StatusCode::Success);
    assert_eq!(
        std::fs::read(env.path("incoming/new.dat")).unwrap(),
        b"hello"
    );

    // The implicit reservation is returned once the upload is final.
    assert!(env.wait_for_calls("release_space", 1).await);
    assert_eq!(env.storage.calls("reserve_space"), 1);
    assert_eq!(env.storage.calls("unmark_space_in_use"), 1);
    assert_eq!(env.storage.calls("abort_put"), 0);
}

#[tokio::test]
async fn test_put_without_free_space_fails() {
    let env = TestEnv::build(test_config(), |storage| storage.with_capacity(100)).await;

    let reserved = handlers::submit_reserve_space(
        env.handlers(),
        ReserveSpaceSubmit {
            request: request_data(),
            size_in_bytes: 80,
            desired_lifetime: Some(Duration::from_secs(3600)),
            space_description: None,
            lifetime: None,
        },
    )
    .await;
    let token = reserved.reservation.unwrap().request_token;
    assert!(
        eventually(|| async {
            handlers::get_reserve_space_status(env.handlers(), &token)
                .await
                .reservation
                .is_some_and(|reservation| reservation.state == State::Done)
        })
        .await
    );

    let surl = env.surl("incoming/big.dat");
    let response = env
        .submit(RequestType::Put, vec![NewFile::new(&surl).with_size(50)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    assert_eq!(file.status.code, StatusCode::NoFreeSpace);
    assert_eq!(response.status.code, StatusCode::NoFreeSpace);
    // The upload prepared before the reservation failed is dropped.
    assert!(env.wait_for_calls("abort_put", 1).await);
}

/// A granted reservation the client owns.
async fn client_space(env: &TestEnv) -> String {
    let reserved = handlers::submit_reserve_space(
        env.handlers(),
        ReserveSpaceSubmit {
            request: request_data(),
            size_in_bytes: 1024,
            desired_lifetime: Some(Duration::from_secs(3600)),
            space_description: None,
            lifetime: None,
        },
    )
    .await;
    let token = reserved.reservation.unwrap().request_token;
    assert!(
        eventually(|| async {
            handlers::get_reserve_space_status(env.handlers(), &token)
                .await
                .reservation
                .is_some_and(|reservation| reservation.state == State::Done)
        })
        .await
    );
    handlers::get_reserve_space_status(env.handlers(), &token)
        .await
        .reservation
        .and_then(|reservation| reservation.space_token)
        .expect("space token of a granted reservation")
}

async fn upload(env: &TestEnv, surl: &str, options: RequestOptions) {
    let response = env
        .submit_with(
            RequestType::Put,
            vec![NewFile::new(surl).with_size(4)],
            options,
            None,
        )
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_all(&token, State::Ready).await;
    let turl = response.file_statuses[0].turl.clone().unwrap();
    write_file(&turl_path(&turl), b"data");

    let done = put_done(env, &token, &[surl]).await;
    assert_eq!(done.status.code, StatusCode::Success);
    env.wait_for_all(&token, State::Done).await;
}

#[tokio::test]
async fn test_client_space_is_not_released() {
    let env = TestEnv::new().await;
    let space_token = client_space(&env).await;
    let surl = env.surl("incoming/in-space.dat");

    let options = RequestOptions {
        space_token: Some(space_token.clone()),
        ..file_options()
    };
    upload(&env, &surl, options).await;

    assert!(env.wait_for_calls("unmark_space_in_use", 1).await);
    assert_eq!(env.storage.calls("mark_space_in_use"), 1);
    // Only the client's own reservation.
    assert_eq!(env.storage.calls("reserve_space"), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.storage.calls("release_space"), 0);
}

#[tokio::test]
async fn test_inherited_directory_space_is_not_released() {
    let env = TestEnv::new().await;
    let space_token = client_space(&env).await;
    env.storage
        .inner()
        .set_directory_space_token(&env.surl("shared"), space_token)
        .unwrap();
    let surl = env.surl("shared/inherited.dat");

    upload(&env, &surl, file_options()).await;

    assert!(env.wait_for_calls("unmark_space_in_use", 1).await);
    assert_eq!(env.storage.calls("reserve_space"), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.storage.calls("release_space"), 0);
    assert_eq!(std::fs::read(env.path("shared/inherited.dat")).unwrap(), b"data");
}

#[tokio::test]
async fn test_put_done_without_data_fails() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/empty.dat");

    let response = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::Ready).await;

    let done = put_done(&env, &token, &[&surl]).await;
    assert_eq!(done.files[0].status.code, StatusCode::InvalidPath);
    assert_eq!(done.status.code, StatusCode::Failure);

    let response = env.status(&token).await;
    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    assert_eq!(file.status.code, StatusCode::InvalidPath);
    assert!(!env.path("incoming/empty.dat").exists());
}

#[tokio::test]
async fn test_concurrent_uploads_conflict() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/shared.dat");

    let first = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let first_token = first.request_token.unwrap();
    env.wait_for_all(&first_token, State::Ready).await;

    let second = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let second_token = second.request_token.unwrap();
    let response = env.wait_for_final(&second_token).await;
    assert_eq!(response.file_statuses[0].state, State::Failed);
    assert_eq!(
        response.file_statuses[0].status.code,
        StatusCode::DuplicationError
    );

    let aborted = handlers::abort_request(
        env.handlers(),
        AbortRequest {
            request_token: first_token.clone(),
            reason: "changed my mind".to_string(),
        },
    )
    .await;
    assert_eq!(aborted.code, StatusCode::Success);
    let response = env.status(&first_token).await;
    assert_eq!(response.file_statuses[0].state, State::Canceled);
    assert_eq!(response.status.code, StatusCode::Aborted);
    assert!(env.wait_for_calls("abort_put", 1).await);

    // The SURL is free again.
    let third = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let third_token = third.request_token.unwrap();
    let response = env.wait_for_all(&third_token, State::Ready).await;
    write_file(
        &turl_path(response.file_statuses[0].turl.as_deref().unwrap()),
        b"third",
    );
    let done = put_done(&env, &third_token, &[&surl]).await;
    assert_eq!(done.status.code, StatusCode::Success);
    assert_eq!(
        std::fs::read(env.path("incoming/shared.dat")).unwrap(),
        b"third"
    );
}

#[tokio::test]
async fn test_put_done_rejects_bad_surls() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/one.dat");
    let response = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    env.wait_for_all(&token, State::Ready).await;

    let unknown = env.surl("incoming/other.dat");
    let done = put_done(&env, &token, &[&unknown]).await;
    assert_eq!(done.files[0].status.code, StatusCode::InvalidPath);

    let done = put_done(&env, &token, &[]).await;
    assert_eq!(done.status.code, StatusCode::InvalidRequest);
    assert!(done.files.is_empty());

    // Neither call touched the upload.
    let response = env.status(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Ready);
}

#[tokio::test]
async fn test_existing_file_needs_overwrite() {
    let env = TestEnv::new().await;
    let surl = env.write_file("incoming/old.dat", b"old");

    let response = env.submit(RequestType::Put, vec![NewFile::new(&surl)]).await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Failed);
    assert_eq!(
        response.file_statuses[0].status.code,
        StatusCode::DuplicationError
    );

    let options = RequestOptions {
        overwrite: true,
        ..file_options()
    };
    let response = env
        .submit_with(RequestType::Put, vec![NewFile::new(&surl)], options, None)
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_all(&token, State::Ready).await;
    write_file(
        &turl_path(response.file_statuses[0].turl.as_deref().unwrap()),
        b"new",
    );
    let done = put_done(&env, &token, &[&surl]).await;
    assert_eq!(done.status.code, StatusCode::Success);
    assert_eq!(std::fs::read(env.path("incoming/old.dat")).unwrap(), b"new");
}

#[tokio::test]
async fn test_put_needs_a_protocol() {
    let env = TestEnv::new().await;
    let surl = env.surl("incoming/noproto.dat");

    let response = env
        .submit_with(
            RequestType::Put,
            vec![NewFile::new(&surl)],
            RequestOptions::default(),
            None,
        )
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;
    assert_eq!(response.file_statuses[0].status.code, StatusCode::NotSupported);
}
