//! Scheduling core: the bounded ready queue, the lease table, the
//! promotion loop that feeds the queue from the store, and the reaper
//! that requeues work whose lease expired.

pub mod lease;
pub mod ready;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{HyperError, Result};
use crate::store::{NewTask, Requeued, Task, TaskPatch, TaskState, TaskStore};

pub use lease::{Lease, LeaseTable};
pub use ready::ReadyQueue;

/// How often the promotion loop polls the store for NEW tasks that arrived
/// out-of-process (e.g. `hyper-shell submit`).
const PROMOTE_INTERVAL: Duration = Duration::from_millis(500);

/// How often the reaper sweeps for expired leases.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    ready: ReadyQueue,
    leases: Mutex<LeaseTable>,
    max_attempts: u32,
    lease_ttl: chrono::Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, maxsize: usize, max_attempts: u32, ttl: Duration) -> Self {
        Self {
            store,
            ready: ReadyQueue::new(maxsize),
            leases: Mutex::new(LeaseTable::default()),
            max_attempts: max_attempts.max(1),
            lease_ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Submit one task: persist it, confirm, then enqueue for dispatch.
    /// Suspends while the ready queue is full (submission backpressure).
    pub async fn submit(&self, spec: NewTask) -> Result<Task> {
        let task = self.store.insert(spec).await?;
        // Freshly inserted in NEW; promote once durably persisted. A
        // re-submitted uuid may already be past NEW, which is fine.
        let task = match self
            .store
            .update_state(task.id, TaskState::New, TaskState::Ready, TaskPatch::default())
            .await
        {
            Ok(task) => task,
            Err(HyperError::Conflict { .. }) => return Ok(task),
            Err(err) => return Err(err),
        };
        self.ready.push(task.id).await;
        tracing::debug!(task_id = task.id, "Task queued");
        Ok(task)
    }

    /// Recover dispatchable work after a restart: interrupted ASSIGNED
    /// tasks return to READY, then everything READY is queued again.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.store.recover().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered interrupted tasks");
        }
        let ready = self
            .store
            .query(crate::store::TaskFilter {
                state: Some(TaskState::Ready),
                limit: None,
            })
            .await?;
        for task in ready {
            self.ready.push(task.id).await;
        }
        Ok(recovered)
    }

    /// Lease up to `max_batch` tasks to a client. Pops ids from the ready
    /// queue (waiting for the first) and CAS-assigns each; an id that lost
    /// a race is skipped. Returns an empty vec only once the queue is
    /// closed and drained.
    pub async fn lease_next(
        &self,
        client_id: Uuid,
        host: &str,
        max_batch: usize,
    ) -> Result<Vec<(Task, Lease)>> {
        let ids = self.ready.pop_batch(max_batch).await;
        let mut leased = Vec::with_capacity(ids.len());
        for id in ids {
            let lease = self.leases.lock().await.grant(id, client_id, self.lease_ttl);
            match self
                .store
                .update_state(id, TaskState::Ready, TaskState::Assigned, TaskPatch::assigned(host))
                .await
            {
                Ok(task) => {
                    tracing::debug!(task_id = id, client_id = %client_id, "Task leased");
                    leased.push((task, lease));
                }
                Err(HyperError::Conflict { actual, .. }) => {
                    // Another writer moved it (reaper abandon, shutdown);
                    // drop the provisional lease and move on.
                    self.leases.lock().await.release(id);
                    tracing::debug!(task_id = id, state = %actual, "Skipped stale queue entry");
                }
                Err(err) => {
                    self.leases.lock().await.release(id);
                    return Err(err);
                }
            }
        }
        Ok(leased)
    }

    /// Record a result from a client. The reporting client must still hold
    /// the lease: a result that arrives after expiry and reassignment is
    /// rejected so the current holder's outcome wins. The lease is
    /// destroyed and the task transitions ASSIGNED → DONE/FAILED by exit
    /// status.
    pub async fn complete(
        &self,
        client_id: Uuid,
        task_id: i64,
        exit_status: i32,
        start_time: Option<chrono::DateTime<Utc>>,
        complete_time: Option<chrono::DateTime<Utc>>,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        {
            let mut leases = self.leases.lock().await;
            match leases.get(task_id) {
                Some(lease) if lease.client_id == client_id => {
                    leases.release(task_id);
                }
                _ => {
                    return Err(HyperError::Timeout(format!(
                        "lease for task {task_id} is no longer held by this client"
                    )));
                }
            }
        }
        let to = if exit_status == 0 {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        let patch = TaskPatch {
            host: None,
            start_time,
            complete_time: complete_time.or_else(|| Some(Utc::now())),
            exit_status: Some(exit_status),
            output,
            error,
        };
        let task = self
            .store
            .update_state(task_id, TaskState::Assigned, to, patch)
            .await?;
        tracing::debug!(task_id, exit_status, state = %task.state, "Task completed");
        Ok(task)
    }

    /// Revoke every lease held by a lost client and requeue its tasks.
    pub async fn release_client(&self, client_id: Uuid) {
        let revoked = self.leases.lock().await.take_client(client_id);
        if revoked.is_empty() {
            return;
        }
        tracing::info!(client_id = %client_id, count = revoked.len(), "Revoking leases for lost client");
        for lease in revoked {
            self.requeue(lease.task_id).await;
        }
    }

    /// Requeue one task whose lease is gone; abandons when attempts are
    /// exhausted.
    async fn requeue(&self, task_id: i64) {
        match self.store.requeue(task_id, self.max_attempts).await {
            Ok(Requeued::Ready(task)) => {
                tracing::info!(task_id, attempt = task.attempt, "Task requeued");
                if !self.ready.try_push(task.id) {
                    // Queue full or closing; the promotion loop will pick
                    // the READY row back up.
                    tracing::debug!(task_id, "Requeued task left for promoter");
                }
            }
            Ok(Requeued::Abandoned(task)) => {
                tracing::warn!(task_id, attempt = task.attempt, "Task abandoned");
            }
            Err(HyperError::Conflict { actual, .. }) => {
                tracing::debug!(task_id, state = %actual, "Requeue skipped, task moved on");
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "Requeue failed");
            }
        }
    }

    /// Promotion loop: keep the ready queue topped up from the store while
    /// there is room. Picks up NEW rows written by out-of-process
    /// submitters and READY rows left behind by a full queue.
    pub async fn run_promoter(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(PROMOTE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let room = self.ready.room();
            if room == 0 {
                continue;
            }
            match self.store.promote_new(room).await {
                Ok(promoted) => {
                    for task in promoted {
                        if !self.ready.push(task.id).await {
                            return; // queue closed
                        }
                    }
                }
                Err(err) => {
                    // Promotion pauses until the store recovers.
                    tracing::error!(error = %err, "Promotion failed; pausing");
                    continue;
                }
            }
            if let Err(err) = self.reclaim_ready().await {
                tracing::error!(error = %err, "Ready reclaim failed");
            }
        }
    }

    /// Re-enqueue READY rows that are not in the queue: requeues that hit
    /// a full queue, or work popped by a session torn down before its
    /// lease was granted. Duplicates are harmless (the assignment CAS
    /// skips stale entries), so this errs on the side of pushing.
    async fn reclaim_ready(&self) -> Result<()> {
        let room = self.ready.room();
        if room == 0 {
            return Ok(());
        }
        let horizon = (self.ready.len() + room) as u32;
        let ready_rows = self
            .store
            .query(crate::store::TaskFilter {
                state: Some(TaskState::Ready),
                limit: Some(horizon),
            })
            .await?;
        for task in ready_rows {
            if !self.ready.contains(task.id) && !self.ready.try_push(task.id) {
                break;
            }
        }
        Ok(())
    }

    /// Lease reaper: wakes every second, requeues expired leases.
    pub async fn run_reaper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let expired = self.leases.lock().await.take_expired(Utc::now());
            for lease in expired {
                tracing::warn!(
                    task_id = lease.task_id,
                    client_id = %lease.client_id,
                    "Lease expired"
                );
                self.requeue(lease.task_id).await;
            }
        }
    }

    /// Number of leases currently outstanding.
    pub async fn outstanding_leases(&self) -> usize {
        self.leases.lock().await.len()
    }

    /// Mark every unfinished task abandoned (forced shutdown path).
    pub async fn abandon_unfinished(&self) -> Result<u64> {
        let mut abandoned = 0;
        for state in [TaskState::New, TaskState::Ready, TaskState::Assigned] {
            let tasks = self
                .store
                .query(crate::store::TaskFilter {
                    state: Some(state),
                    limit: None,
                })
                .await?;
            for task in tasks {
                let patch = TaskPatch {
                    complete_time: Some(Utc::now()),
                    ..TaskPatch::default()
                };
                match self
                    .store
                    .update_state(task.id, state, TaskState::Abandoned, patch)
                    .await
                {
                    Ok(_) => abandoned += 1,
                    Err(HyperError::Conflict { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn scheduler(maxsize: usize, max_attempts: u32) -> Scheduler {
        Scheduler::new(
            Arc::new(MemoryStore::new()),
            maxsize,
            max_attempts,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn submit_promotes_and_queues() {
        let sched = scheduler(10, 1);
        let task = sched.submit(NewTask::new("echo hi")).await.unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(sched.ready().len(), 1);
    }

    #[tokio::test]
    async fn lease_assigns_fifo() {
        let sched = scheduler(10, 1);
        for name in ["a", "b", "c"] {
            sched.submit(NewTask::new(name)).await.unwrap();
        }
        let client = Uuid::new_v4();
        let leased = sched.lease_next(client, "host1", 2).await.unwrap();
        let args: Vec<&str> = leased.iter().map(|(t, _)| t.args.as_str()).collect();
        assert_eq!(args, ["a", "b"]);
        assert_eq!(leased[0].0.state, TaskState::Assigned);
        assert_eq!(sched.outstanding_leases().await, 2);
    }

    #[tokio::test]
    async fn complete_records_terminal_state() {
        let sched = scheduler(10, 1);
        let task = sched.submit(NewTask::new("true")).await.unwrap();
        let client = Uuid::new_v4();
        sched.lease_next(client, "host1", 1).await.unwrap();

        let done = sched
            .complete(client, task.id, 0, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Done);
        assert_eq!(sched.outstanding_leases().await, 0);

        // The lease is gone, so a second completion is rejected as late.
        let err = sched
            .complete(client, task.id, 1, None, None, None, None)
            .await;
        assert!(matches!(err, Err(HyperError::Timeout(_))));
    }

    #[tokio::test]
    async fn late_result_from_previous_holder_rejected() {
        let sched = scheduler(10, 3);
        let task = sched.submit(NewTask::new("sleep 60")).await.unwrap();
        let first = Uuid::new_v4();
        sched.lease_next(first, "host1", 1).await.unwrap();

        // First client is lost; the task is requeued and re-leased.
        sched.release_client(first).await;
        let second = Uuid::new_v4();
        sched.lease_next(second, "host2", 1).await.unwrap();

        let err = sched
            .complete(first, task.id, 0, None, None, None, None)
            .await;
        assert!(matches!(err, Err(HyperError::Timeout(_))));

        let done = sched
            .complete(second, task.id, 0, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Done);
    }

    #[tokio::test]
    async fn lost_client_requeues_with_attempt_bump() {
        let sched = scheduler(10, 2);
        let task = sched.submit(NewTask::new("sleep 60")).await.unwrap();
        let client = Uuid::new_v4();
        sched.lease_next(client, "host1", 1).await.unwrap();

        sched.release_client(client).await;
        let task = sched.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.attempt, 2);
        assert_eq!(sched.ready().len(), 1);
    }

    #[tokio::test]
    async fn lost_client_abandons_when_attempts_exhausted() {
        let sched = scheduler(10, 1);
        let task = sched.submit(NewTask::new("sleep 60")).await.unwrap();
        let client = Uuid::new_v4();
        sched.lease_next(client, "host1", 1).await.unwrap();

        sched.release_client(client).await;
        let task = sched.store().get(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Abandoned);
        assert!(sched.ready().is_empty());
    }
}
