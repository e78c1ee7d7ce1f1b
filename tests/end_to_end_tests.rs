//! End-to-end tests over loopback TCP: submit → dispatch → execute →
//! collect, with real shell children.


use std::collections::HashSet;
use std::time::Duration;

use hyper_shell::store::NewTask;
use hyper_shell::submit::submit_stream;
use test_harness::*;

const TTL: Duration = Duration::from_secs(300);

/// Four echo tasks across two clients: everything DONE, failure sink
/// empty, outputs are the full set in some order.
#[tokio::test]
async fn hello_world_two_clients() {
    let server = start_server(100, 1, TTL).await;
    let input = b"0\n1\n2\n3\n" as &[u8];
    submit_stream(&server.handle.scheduler, input).await.unwrap();

    let client_a = spawn_client(server.port(), "echo {}", 1);
    let client_b = spawn_client(server.port(), "echo {}", 1);

    server.wait_drained().await.unwrap();
    let counts = server.handle.scheduler.store().counts().await.unwrap();
    assert_eq!(counts.done, 4);
    assert_eq!(counts.failed, 0);

    let failure_path = server.failure_path.clone();
    let output_path = server.output_path.clone();
    server.handle.shutdown(Duration::from_secs(5)).await.unwrap();
    client_a.await.unwrap().unwrap();
    client_b.await.unwrap().unwrap();

    assert!(sink_lines(&failure_path).is_empty());
    let outputs: HashSet<String> = sink_lines(&output_path).into_iter().collect();
    let expected: HashSet<String> = ["0", "1", "2", "3"].iter().map(|s| s.to_string()).collect();
    assert_eq!(outputs, expected);
}

/// true/false sieve: two DONE, two FAILED, and the failure sink holds
/// exactly the failing lines.
#[tokio::test]
async fn failure_sieve() {
    let server = start_server(100, 1, TTL).await;
    let input = b"true\nfalse\ntrue\nfalse\n" as &[u8];
    submit_stream(&server.handle.scheduler, input).await.unwrap();

    let client = spawn_client(server.port(), "{}", 1);

    server.wait_drained().await.unwrap();
    let counts = server.handle.scheduler.store().counts().await.unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.failed, 2);

    let failure_path = server.failure_path.clone();
    server.handle.shutdown(Duration::from_secs(5)).await.unwrap();
    client.await.unwrap().unwrap();

    assert_eq!(sink_lines(&failure_path), vec!["false", "false"]);
}

/// A failing task never retries: one attempt, terminal FAILED.
#[tokio::test]
async fn nonzero_exit_does_not_retry() {
    let server = start_server(100, 3, TTL).await;
    let task = server
        .handle
        .scheduler
        .submit(NewTask::new("exit 3"))
        .await
        .unwrap();

    let client = spawn_client(server.port(), "{}", 1);
    server.wait_drained().await.unwrap();

    let stored = server
        .handle
        .scheduler
        .store()
        .get(task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, hyper_shell::store::TaskState::Failed);
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.exit_status, Some(3));
    assert!(stored.host.is_some());
    assert!(stored.submit_time <= stored.start_time.unwrap());
    assert!(stored.start_time.unwrap() <= stored.complete_time.unwrap());

    server.handle.shutdown(Duration::from_secs(5)).await.unwrap();
    client.await.unwrap().unwrap();
}

/// A client that takes a task and drops the connection loses its lease;
/// the task is requeued with the attempt bumped and another client
/// finishes it.
#[tokio::test]
async fn client_loss_requeues_task() {
    let server = start_server(100, 2, TTL).await;
    let task = server
        .handle
        .scheduler
        .submit(NewTask::new("echo recovered"))
        .await
        .unwrap();

    let mut raw = connect_raw(server.port(), TEST_KEY).await.unwrap();
    raw.request(1).await.unwrap();
    let tasks = raw.recv_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task.id);
    assert_eq!(tasks[0].attempt, 1);
    drop(raw); // connection lost mid-task

    // The disconnect revokes the lease immediately; the task is READY
    // again with attempt 2 before any timer fires.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = server
                .handle
                .scheduler
                .store()
                .get(task.id)
                .await
                .unwrap()
                .unwrap();
            if stored.attempt == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("task should be requeued with attempt 2");

    let client = spawn_client(server.port(), "{}", 1);
    server.wait_drained().await.unwrap();

    let stored = server
        .handle
        .scheduler
        .store()
        .get(task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, hyper_shell::store::TaskState::Done);
    assert_eq!(stored.attempt, 2);

    server.handle.shutdown(Duration::from_secs(5)).await.unwrap();
    client.await.unwrap().unwrap();
}

/// Second loss with max_attempts=1: the task is abandoned, not requeued.
#[tokio::test]
async fn client_loss_abandons_when_out_of_attempts() {
    let server = start_server(100, 1, TTL).await;
    let task = server
        .handle
        .scheduler
        .submit(NewTask::new("echo never"))
        .await
        .unwrap();

    let mut raw = connect_raw(server.port(), TEST_KEY).await.unwrap();
    raw.request(1).await.unwrap();
    let _ = raw.recv_tasks().await;
    drop(raw);

    server.wait_drained().await.unwrap();
    let stored = server
        .handle
        .scheduler
        .store()
        .get(task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, hyper_shell::store::TaskState::Abandoned);
    server.handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// A bad key is turned away at the handshake and the client surfaces an
/// auth error (exit code 3 at the CLI).
#[tokio::test]
async fn bad_authkey_rejected() {
    let server = start_server(100, 1, TTL).await;
    let client = spawn_client_with_key(server.port(), "{}", 1, "wrong-key");
    let err = client.await.unwrap().unwrap_err();
    assert!(matches!(err, hyper_shell::error::HyperError::Auth(_)));
    assert_eq!(err.exit_code(), 3);
    server.handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// Lease expiry requeues without the client disconnecting: a raw session
/// sits on its task past the TTL and the reaper takes it back.
#[tokio::test]
async fn lease_expiry_requeues() {
    let server = start_server(100, 2, Duration::from_secs(1)).await;
    let task = server
        .handle
        .scheduler
        .submit(NewTask::new("echo late"))
        .await
        .unwrap();

    let mut raw = connect_raw(server.port(), TEST_KEY).await.unwrap();
    raw.request(1).await.unwrap();
    let _ = raw.recv_tasks().await;
    // Hold the connection open but never report a result.

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stored = server
                .handle
                .scheduler
                .store()
                .get(task.id)
                .await
                .unwrap()
                .unwrap();
            if stored.attempt == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("lease should expire and requeue the task");

    drop(raw);
    server.handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

/// Environment injection: an exported variable reaches the task with the
/// prefix stripped.
#[tokio::test]
async fn export_env_reaches_task() {
    // Process-wide env var; the name is unique to this test to keep the
    // suite parallel-safe.
    std::env::set_var("HYPERSHELL_EXPORT_E2E_FOO", "bar");
    let server = start_server(100, 1, TTL).await;
    submit_stream(&server.handle.scheduler, b"marker\n" as &[u8])
        .await
        .unwrap();

    let client = spawn_client(server.port(), "echo $E2E_FOO", 1);
    server.wait_drained().await.unwrap();

    let output_path = server.output_path.clone();
    server.handle.shutdown(Duration::from_secs(5)).await.unwrap();
    client.await.unwrap().unwrap();

    assert_eq!(sink_lines(&output_path), vec!["bar marker"]);
}
