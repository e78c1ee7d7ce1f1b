use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{HyperError, Result};
use crate::store::task::{NewTask, Requeued, Task, TaskFilter, TaskPatch, TaskState};
use crate::store::{StateCounts, TaskStore};

/// Volatile store: the live generation only, ordered by id. Ids are
/// assigned monotonically at insert, so id order is submit order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<i64, Task>,
    by_uuid: HashMap<Uuid, i64>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply(task: &mut Task, to: TaskState, patch: TaskPatch) {
    task.state = to;
    if patch.host.is_some() {
        task.host = patch.host;
    }
    if patch.start_time.is_some() {
        task.start_time = patch.start_time;
    }
    if patch.complete_time.is_some() {
        task.complete_time = patch.complete_time;
    }
    if patch.exit_status.is_some() {
        task.exit_status = patch.exit_status;
    }
    if patch.output.is_some() {
        task.output = patch.output;
    }
    if patch.error.is_some() {
        task.error = patch.error;
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, task: NewTask) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        if let Some(&id) = inner.by_uuid.get(&task.uuid) {
            let existing = inner
                .tasks
                .get(&id)
                .cloned()
                .ok_or(HyperError::NotFound(id))?;
            return Ok(existing);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let record = Task {
            id,
            uuid: task.uuid,
            args: task.args,
            template: task.template,
            state: TaskState::New,
            submit_time: task.submit_time,
            start_time: None,
            complete_time: None,
            host: None,
            attempt: 1,
            exit_status: None,
            output: None,
            error: None,
        };
        inner.by_uuid.insert(record.uuid, id);
        inner.tasks.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: i64,
        from: TaskState,
        to: TaskState,
        patch: TaskPatch,
    ) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or(HyperError::NotFound(id))?;
        if task.state != from {
            return Err(HyperError::Conflict {
                id,
                expected: from.to_string(),
                actual: task.state.to_string(),
            });
        }
        apply(task, to, patch);
        Ok(task.clone())
    }

    async fn promote_new(&self, limit: usize) -> Result<Vec<Task>> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<i64> = inner
            .tasks
            .values()
            .filter(|task| task.state == TaskState::New)
            .take(limit)
            .map(|task| task.id)
            .collect();
        let mut promoted = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Ready;
                promoted.push(task.clone());
            }
        }
        Ok(promoted)
    }

    async fn next_ready(&self, limit: usize, host: &str) -> Result<Vec<Task>> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<i64> = inner
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Ready)
            .take(limit)
            .map(|task| task.id)
            .collect();
        let mut assigned = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Assigned;
                task.host = Some(host.to_string());
                assigned.push(task.clone());
            }
        }
        Ok(assigned)
    }

    async fn requeue(&self, id: i64, max_attempts: u32) -> Result<Requeued> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or(HyperError::NotFound(id))?;
        if task.state != TaskState::Assigned {
            return Err(HyperError::Conflict {
                id,
                expected: TaskState::Assigned.to_string(),
                actual: task.state.to_string(),
            });
        }
        if task.attempt >= max_attempts {
            task.state = TaskState::Abandoned;
            task.host = None;
            task.complete_time = Some(chrono::Utc::now());
            Ok(Requeued::Abandoned(task.clone()))
        } else {
            task.state = TaskState::Ready;
            task.attempt += 1;
            task.host = None;
            task.start_time = None;
            Ok(Requeued::Ready(task.clone()))
        }
    }

    async fn query(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        let limit = filter.limit.map(|n| n as usize).unwrap_or(usize::MAX);
        Ok(inner
            .tasks
            .values()
            .filter(|task| filter.state.map_or(true, |state| task.state == state))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StateCounts> {
        let inner = self.inner.lock().await;
        let mut counts = StateCounts::default();
        for task in inner.tasks.values() {
            match task.state {
                TaskState::New => counts.new += 1,
                TaskState::Ready => counts.ready += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Abandoned => counts.abandoned += 1,
            }
        }
        Ok(counts)
    }

    async fn recover(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut recovered = 0;
        for task in inner.tasks.values_mut() {
            if task.state == TaskState::Assigned {
                task.state = TaskState::Ready;
                task.host = None;
                task.start_time = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_monotonic_ids() {
        let store = MemoryStore::new();
        let a = store.insert(NewTask::new("a")).await.unwrap();
        let b = store.insert(NewTask::new("b")).await.unwrap();
        assert!(a.id < b.id);
        assert_eq!(a.state, TaskState::New);
        assert_eq!(a.attempt, 1);
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_uuid() {
        let store = MemoryStore::new();
        let spec = NewTask::new("a");
        let first = store.insert(spec.clone()).await.unwrap();
        let again = store.insert(spec).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn cas_rejects_wrong_expectation() {
        let store = MemoryStore::new();
        let task = store.insert(NewTask::new("a")).await.unwrap();
        let err = store
            .update_state(
                task.id,
                TaskState::Ready,
                TaskState::Assigned,
                TaskPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HyperError::Conflict { .. }));
    }

    #[tokio::test]
    async fn promote_then_assign_is_fifo() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            store.insert(NewTask::new(name)).await.unwrap();
        }
        let promoted = store.promote_new(10).await.unwrap();
        assert_eq!(promoted.len(), 3);
        let assigned = store.next_ready(2, "worker1").await.unwrap();
        let args: Vec<&str> = assigned.iter().map(|t| t.args.as_str()).collect();
        assert_eq!(args, ["a", "b"]);
        assert_eq!(assigned[0].host.as_deref(), Some("worker1"));
    }

    #[tokio::test]
    async fn requeue_bumps_attempt_then_abandons() {
        let store = MemoryStore::new();
        let task = store.insert(NewTask::new("a")).await.unwrap();
        store.promote_new(1).await.unwrap();
        store.next_ready(1, "w").await.unwrap();

        match store.requeue(task.id, 2).await.unwrap() {
            Requeued::Ready(task) => assert_eq!(task.attempt, 2),
            other => panic!("expected ready, got {other:?}"),
        }
        store.next_ready(1, "w").await.unwrap();
        match store.requeue(task.id, 2).await.unwrap() {
            Requeued::Abandoned(task) => assert_eq!(task.state, TaskState::Abandoned),
            other => panic!("expected abandoned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recover_returns_assigned_to_ready() {
        let store = MemoryStore::new();
        let task = store.insert(NewTask::new("a")).await.unwrap();
        store.promote_new(1).await.unwrap();
        store.next_ready(1, "w").await.unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert!(task.host.is_none());
    }
}
