//! Scheduler-level integration tests: submission backpressure against a
//! bounded ready queue, and FIFO dispatch order across a large input.

use std::sync::Arc;
use std::time::Duration;

use hyper_shell::scheduler::Scheduler;
use hyper_shell::store::MemoryStore;
use hyper_shell::submit::submit_stream;
use uuid::Uuid;

fn scheduler(maxsize: usize) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        Arc::new(MemoryStore::new()),
        maxsize,
        1,
        Duration::from_secs(300),
    ))
}

/// With maxsize=4 and a slow consumer, the ready queue never exceeds its
/// bound and the submitter only finishes once the consumer makes room.
#[tokio::test]
async fn submission_blocks_on_full_queue() {
    let sched = scheduler(4);
    let input: String = (0..40).map(|i| format!("sleep {i}\n")).collect();

    let submitter = {
        let sched = sched.clone();
        tokio::spawn(async move { submit_stream(&sched, input.as_bytes()).await })
    };

    // Give the submitter time to fill the queue and hit the bound.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sched.ready().len(), 4);
    assert!(
        !submitter.is_finished(),
        "submitter must block while the queue is full"
    );

    // Drain slowly, checking the bound the whole way.
    let client = Uuid::new_v4();
    let mut dispatched = 0;
    while dispatched < 40 {
        let leased = sched.lease_next(client, "host", 2).await.unwrap();
        dispatched += leased.len();
        assert!(sched.ready().len() <= 4, "queue exceeded its bound");
        for (task, _) in leased {
            sched
                .complete(client, task.id, 0, None, None, None, None)
                .await
                .unwrap();
        }
    }

    assert_eq!(submitter.await.unwrap().unwrap(), 40);
    let counts = sched.store().counts().await.unwrap();
    assert_eq!(counts.done, 40);
    assert_eq!(counts.unfinished(), 0);
}

/// Tasks come off the queue in submission order even when leased in
/// odd-sized batches.
#[tokio::test]
async fn dispatch_is_fifo() {
    let sched = scheduler(100);
    let input: String = (0..20).map(|i| format!("task-{i}\n")).collect();
    submit_stream(&sched, input.as_bytes()).await.unwrap();

    let client = Uuid::new_v4();
    let mut seen = Vec::new();
    for batch in [1usize, 3, 7, 2, 7] {
        for (task, _) in sched.lease_next(client, "host", batch).await.unwrap() {
            seen.push(task.args);
        }
    }
    let expected: Vec<String> = (0..20).map(|i| format!("task-{i}")).collect();
    assert_eq!(seen, expected);
}

/// The reaper returns expired leases to the queue with the attempt bumped.
#[tokio::test]
async fn reaper_requeues_expired_leases() {
    let sched = Arc::new(Scheduler::new(
        Arc::new(MemoryStore::new()),
        10,
        2,
        Duration::from_millis(200),
    ));
    let token = tokio_util::sync::CancellationToken::new();
    let reaper = {
        let sched = sched.clone();
        let token = token.clone();
        tokio::spawn(async move { sched.run_reaper(token).await })
    };

    let task = sched
        .submit(hyper_shell::store::NewTask::new("slow"))
        .await
        .unwrap();
    let client = Uuid::new_v4();
    sched.lease_next(client, "host", 1).await.unwrap();
    assert_eq!(sched.outstanding_leases().await, 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = sched.store().get(task.id).await.unwrap().unwrap();
            if stored.attempt == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("expired lease should requeue the task");

    assert_eq!(sched.outstanding_leases().await, 0);
    token.cancel();
    reaper.await.unwrap();
}
