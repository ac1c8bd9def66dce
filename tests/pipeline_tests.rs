// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests: the whole agent against a temporary log tree and a mock
//! bulk endpoint.

use chrono::Utc;
use httpmock::prelude::*;
use logfwd::init::agent::Agent;
use logfwd::init::config::{Config, ElasticsearchConfig};
use logfwd::tailer::checkpoint::Checkpoint;
use logfwd::tailer::watcher::WatchMode;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

const POD_DIR: &str = "pods/kube-system_coredns-abc_9f2e/coredns";

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), BoxError>>,
}

impl Running {
    async fn start(config: Config) -> Running {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Agent::new(config).run(cancel.clone()));

        // startup scan and watcher registration
        tokio::time::sleep(Duration::from_millis(300)).await;
        Running { cancel, handle }
    }

    async fn stop(self) -> Result<(), BoxError> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("agent did not stop")
            .unwrap()
    }
}

fn config(root: &Path, state_path: &Path, port: u16) -> Config {
    Config {
        logs_path: vec![root.to_path_buf()],
        state_path: state_path.to_path_buf(),
        watch_mode: WatchMode::Poll,
        poll_interval_ms: 20,
        rescan_interval_ms: 60_000,
        state_flush_interval_ms: 50,
        shutdown_timeout_ms: 5000,
        elasticsearch: ElasticsearchConfig {
            host: "http://127.0.0.1".to_string(),
            port,
            index_name: "k8s".to_string(),
            flush_interval: 100,
            workers: 2,
            request_timeout_ms: 5000,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn layout(dir: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
    let root = dir.path().join("logs");
    let pod_dir = root.join(POD_DIR);
    fs::create_dir_all(&pod_dir).unwrap();
    (root, pod_dir.join("0.log"), dir.path().join("state.json"))
}

fn bulk_path() -> String {
    format!("/k8s-{}/_bulk", Utc::now().format("%Y.%m.%d"))
}

fn append(path: &Path, data: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(data.as_bytes()).unwrap();
    f.flush().unwrap();
}

fn checkpointed_offset(state_path: &Path, file: &Path) -> Option<u64> {
    let checkpoint = Checkpoint::load(state_path).unwrap()?;
    checkpoint.files.get(file).map(|e| e.offset)
}

async fn wait_for_hits(mock: &httpmock::Mock<'_>, n: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while mock.hits_async().await < n {
        assert!(
            std::time::Instant::now() < deadline,
            "expected {} bulk requests",
            n
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_new_file_is_shipped_with_metadata() {
    let dir = TempDir::new().unwrap();
    let (root, file, state_path) = layout(&dir);

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(bulk_path())
                .header("content-type", "application/json")
                .body_contains("\"message\":\"hello\"")
                .body_contains("\"message\":\"world\"")
                .body_contains("\"namespace\":\"kube-system\"")
                .body_contains("\"pod_name\":\"coredns-abc\"")
                .body_contains("\"container_name\":\"coredns\"")
                .body_contains("\"pod_id\":\"9f2e\"");
            then.status(200).body(r#"{"took":1,"errors":false,"items":[]}"#);
        })
        .await;

    let agent = Running::start(config(&root, &state_path, server.port())).await;
    append(&file, "hello\nworld\n");

    wait_for_hits(&mock, 1).await;
    agent.stop().await.unwrap();

    assert_eq!(checkpointed_offset(&state_path, &file), Some(12));
}

#[tokio::test]
async fn test_restart_does_not_redeliver() {
    let dir = TempDir::new().unwrap();
    let (root, file, state_path) = layout(&dir);

    let first = MockServer::start_async().await;
    let first_mock = first
        .mock_async(|when, then| {
            when.method(POST).path(bulk_path()).body_contains("OLD-1");
            then.status(200);
        })
        .await;

    let agent = Running::start(config(&root, &state_path, first.port())).await;
    append(&file, "OLD-1\nOLD-2\n");
    wait_for_hits(&first_mock, 1).await;
    agent.stop().await.unwrap();
    assert_eq!(checkpointed_offset(&state_path, &file), Some(12));

    // only new lines match, anything else gets a 404 and fails the agent
    let second = MockServer::start_async().await;
    let second_mock = second
        .mock_async(|when, then| {
            when.method(POST).path(bulk_path()).body_contains("NEW-1");
            then.status(200);
        })
        .await;

    let agent = Running::start(config(&root, &state_path, second.port())).await;
    // several flush intervals pass with nothing to send
    tokio::time::sleep(Duration::from_millis(400)).await;
    append(&file, "NEW-1\n");
    wait_for_hits(&second_mock, 1).await;
    agent.stop().await.unwrap();

    assert_eq!(second_mock.hits_async().await, 1);
    assert_eq!(checkpointed_offset(&state_path, &file), Some(18));
}

#[tokio::test]
async fn test_threshold_batch_then_timer_batch() {
    let dir = TempDir::new().unwrap();
    let (root, file, state_path) = layout(&dir);

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path(bulk_path());
            then.status(200);
        })
        .await;

    let mut config = config(&root, &state_path, server.port());
    config.elasticsearch.flush_interval = 1000;
    config.elasticsearch.batch_size = 1024;

    // written in full outside the tree, then moved in
    let staged = dir.path().join("staged.log");
    let content: String = (0..1500).map(|i| format!("line-{}\n", i)).collect();
    fs::write(&staged, &content).unwrap();

    let agent = Running::start(config).await;
    fs::rename(&staged, &file).unwrap();

    // 1024 by size, then the remaining 476 on the next tick
    wait_for_hits(&mock, 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.hits_async().await, 2);

    agent.stop().await.unwrap();
    assert_eq!(
        checkpointed_offset(&state_path, &file),
        Some(content.len() as u64)
    );
}

#[tokio::test]
async fn test_backend_failure_stops_agent_with_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (root, file, state_path) = layout(&dir);

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path(bulk_path());
            then.status(500).body("shard failure");
        })
        .await;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        Agent::new(config(&root, &state_path, server.port())).run(cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    append(&file, "doomed\n");

    // no cancellation, the failed send alone brings the agent down
    let result = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("agent kept running after a delivery failure")
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("500"), "unexpected error: {}", err);
    assert!(mock.hits_async().await >= 1);
    assert_eq!(checkpointed_offset(&state_path, &file), Some(7));
}

#[tokio::test]
async fn test_corrupt_checkpoint_fails_startup_and_is_kept() {
    let dir = TempDir::new().unwrap();
    let (root, _file, state_path) = layout(&dir);
    fs::write(&state_path, b"{ not a checkpoint").unwrap();

    let result = Agent::new(config(&root, &state_path, 9))
        .run(CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(fs::read(&state_path).unwrap(), b"{ not a checkpoint");
}
