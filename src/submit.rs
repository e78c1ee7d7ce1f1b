//! Task submission: read an input stream line by line and turn each
//! remaining line into a task. Blank lines and `#` comments are skipped.
//! Submission through the scheduler blocks while the ready queue is full,
//! which is what bounds memory for arbitrarily large inputs.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::{NewTask, TaskStore};

/// Trim a raw input line down to task args, or None for skippable lines.
fn parse_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        None
    } else {
        Some(trimmed)
    }
}

/// Feed an in-process scheduler from an input stream. Returns the number
/// of tasks submitted. EOF means "no more tasks".
pub async fn submit_stream<R>(scheduler: &Scheduler, reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0;
    while let Some(line) = lines.next_line().await? {
        let Some(args) = parse_line(&line) else {
            continue;
        };
        scheduler.submit(NewTask::new(args)).await?;
        submitted += 1;
    }
    tracing::info!(count = submitted, "Submission finished");
    Ok(submitted)
}

/// Write tasks straight into a (durable) store, for a server picked up
/// elsewhere. Used by `hyper-shell submit`.
pub async fn submit_to_store<R>(store: &Arc<dyn TaskStore>, reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0;
    while let Some(line) = lines.next_line().await? {
        let Some(args) = parse_line(&line) else {
            continue;
        };
        let task = store.insert(NewTask::new(args)).await?;
        tracing::debug!(task_id = task.id, "Task submitted");
        submitted += 1;
    }
    Ok(submitted)
}
