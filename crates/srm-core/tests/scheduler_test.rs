// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler behaviour seen through whole requests: queue limits, retries,
//! ready slots and state change notifications.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use srm_core::config::Config;
use srm_core::handlers::{self, FilesRequest};
use srm_core::job::{JobId, State};
use srm_core::request::{NewFile, RequestType};
use srm_core::scheduler::{JobScheduler, Scheduler, StateChangeListener};
use srm_core::status::StatusCode;
use srm_core::storage::StorageError;

fn scheduler(env: &TestEnv, id: &str) -> Arc<JobScheduler> {
    env.runtime
        .schedulers()
        .iter()
        .find(|scheduler| scheduler.id() == id)
        .cloned()
        .expect("scheduler")
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(JobId, State, State)>>,
}

impl StateChangeListener for Recorder {
    fn state_changed(&self, job_id: JobId, old: State, new: State) {
        self.seen.lock().unwrap().push((job_id, old, new));
    }
}

#[tokio::test]
async fn test_full_queue_fails_new_jobs() {
    let env = TestEnv::with_config(Config {
        max_requests: 1,
        max_in_progress: 1,
        ..test_config()
    })
    .await;
    env.storage.delay("pin_file", Duration::from_secs(1));
    let a = env.write_file("a", b"a");
    let b = env.write_file("b", b"b");
    let c = env.write_file("c", b"c");

    // Occupies the only in-progress slot while its pin is pending.
    let first = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&a)])
        .await;
    let first_token = first.request_token.unwrap();
    env.wait_for_all(&first_token, State::AsyncWait).await;

    let second = env
        .submit(
            RequestType::BringOnline,
            vec![NewFile::new(&b), NewFile::new(&c)],
        )
        .await;
    let token = second.request_token.clone().unwrap();
    assert_eq!(second.file_statuses[0].state, State::TQueued);
    assert_eq!(second.file_statuses[1].state, State::Failed);
    let explanation = second.file_statuses[1].status.explanation.clone().unwrap();
    assert!(explanation.contains("Site busy"), "{}", explanation);

    // The queued file runs once the first request finishes.
    let response = env.wait_for_final(&token).await;
    assert_eq!(response.file_statuses[0].state, State::Done);
    assert_eq!(response.status.code, StatusCode::PartialSuccess);
    assert_eq!(env.status(&first_token).await.status.code, StatusCode::Success);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let env = TestEnv::new().await;
    let surl = env.write_file("data/retry", b"x");
    env.storage
        .fail_next("pin_file", StorageError::Internal("flaky".to_string()));

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Done);
    assert_eq!(response.status.code, StatusCode::Success);
    assert_eq!(env.storage.calls("pin_file"), 2);

    let history = env.file_history(file.file_request_id).await;
    assert!(history.contains(&State::RetryWait), "{:?}", history);
    assert!(history.contains(&State::PriorityTQueued), "{:?}", history);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let env = TestEnv::with_config(Config {
        max_retries: 1,
        ..test_config()
    })
    .await;
    let surl = env.write_file("data/flaky", b"x");
    for _ in 0..2 {
        env.storage
            .fail_next("pin_file", StorageError::Internal("flaky".to_string()));
    }

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;

    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    let explanation = file.status.explanation.clone().unwrap();
    assert!(
        explanation.contains("Maximum number of retries exceeded"),
        "{}",
        explanation
    );
    assert_eq!(env.storage.calls("pin_file"), 2);
    assert_eq!(response.status.code, StatusCode::Failure);
}

#[tokio::test]
async fn test_ready_slots_are_limited() {
    let env = TestEnv::with_config(Config {
        max_ready_jobs: 1,
        ..test_config()
    })
    .await;
    let a = env.write_file("a", b"a");
    let b = env.write_file("b", b"b");

    let response = env
        .submit(RequestType::Get, vec![NewFile::new(&a), NewFile::new(&b)])
        .await;
    let token = response.request_token.unwrap();
    let response = env
        .wait_for_files(&token, |files| {
            let ready = files.iter().filter(|f| f.state == State::Ready).count();
            let waiting = files.iter().filter(|f| f.state == State::RQueued).count();
            ready == 1 && waiting == 1
        })
        .await;
    let ready = response
        .file_statuses
        .iter()
        .find(|file| file.state == State::Ready)
        .unwrap()
        .clone();
    let waiting = response
        .file_statuses
        .iter()
        .find(|file| file.state == State::RQueued)
        .unwrap()
        .clone();
    assert!(ready.turl.is_some());
    assert!(waiting.turl.is_none());

    let get = scheduler(&env, "get");
    assert!(eventually(|| async { get.ready_queued_len() == 1 }).await);
    assert_eq!(get.count(State::Ready), 1);

    let released = handlers::release_files(
        env.handlers(),
        FilesRequest {
            request_token: token.clone(),
            surls: vec![ready.surl.clone()],
        },
    )
    .await;
    assert_eq!(released.status.code, StatusCode::Success);

    let response = env
        .wait_for_files(&token, |files| {
            files
                .iter()
                .any(|f| f.surl == waiting.surl && f.state == State::Ready)
        })
        .await;
    let now_ready = response
        .file_statuses
        .iter()
        .find(|file| file.surl == waiting.surl)
        .unwrap();
    assert_eq!(now_ready.status.code, StatusCode::FilePinned);
    assert_eq!(get.ready_queued_len(), 0);
}

#[tokio::test]
async fn test_listeners_see_every_transition() {
    let env = TestEnv::new().await;
    let recorder = Arc::new(Recorder::default());
    scheduler(&env, "bring-online").add_listener(recorder.clone());
    let surl = env.write_file("data/watched", b"x");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let token = response.request_token.unwrap();
    let response = env.wait_for_final(&token).await;
    let id = response.file_statuses[0].file_request_id;

    let seen: Vec<(State, State)> = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(job_id, _, _)| *job_id == id)
        .map(|(_, old, new)| (*old, *new))
        .collect();
    assert_eq!(
        seen,
        vec![
            (State::Pending, State::TQueued),
            (State::TQueued, State::Running),
            (State::Running, State::AsyncWait),
            (State::AsyncWait, State::Done),
        ]
    );

    let bring_online = scheduler(&env, "bring-online");
    assert_eq!(bring_online.count(State::AsyncWait), 0);
    assert_eq!(bring_online.count(State::Running), 0);
    assert!(bring_online.info().contains("Scheduler id=bring-online"));
}

#[tokio::test]
async fn test_stopped_scheduler_rejects_jobs() {
    let env = TestEnv::new().await;
    scheduler(&env, "bring-online").stop();
    let surl = env.write_file("data/late", b"x");

    let response = env
        .submit(RequestType::BringOnline, vec![NewFile::new(&surl)])
        .await;
    let file = &response.file_statuses[0];
    assert_eq!(file.state, State::Failed);
    assert_eq!(file.status.code, StatusCode::InternalError);
    assert_eq!(response.status.code, StatusCode::Failure);
}

#[tokio::test]
async fn test_concurrent_requests_all_complete() {
    let env = TestEnv::with_config(Config {
        thread_pool_size: 2,
        ..test_config()
    })
    .await;
    let surls: Vec<String> = (0..8)
        .map(|i| env.write_file(&format!("tape/batch-{}.tar", i), b"batch"))
        .collect();

    let responses = futures::future::join_all(
        surls
            .iter()
            .map(|surl| env.submit(RequestType::BringOnline, vec![NewFile::new(surl)])),
    )
    .await;

    for response in responses {
        let token = response.request_token.unwrap();
        let response = env.wait_for_final(&token).await;
        assert_eq!(response.status.code, StatusCode::Success);
    }
    assert_eq!(env.storage.calls("pin_file"), 8);

    let bring_online = scheduler(&env, "bring-online");
    assert_eq!(bring_online.queued_len(), 0);
    assert_eq!(bring_online.priority_queued_len(), 0);
}
