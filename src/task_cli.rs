//! Read-only task reporting over the durable store: `task show`,
//! `task status`, `task search`, and `task wait`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{HyperError, Result};
use crate::store::{Task, TaskFilter, TaskState, TaskStore};

/// Output shape for `task search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFormat {
    Table,
    Json,
    Csv,
    /// Raw args only, one per line.
    Raw,
    /// Count of matches only.
    Count,
}

pub async fn show(store: &Arc<dyn TaskStore>, id: i64) -> Result<String> {
    let task = store.get(id).await?.ok_or(HyperError::NotFound(id))?;
    serde_json::to_string_pretty(&task)
        .map_err(|err| HyperError::Fatal(format!("cannot render task: {err}")))
}

pub async fn status(store: &Arc<dyn TaskStore>) -> Result<String> {
    let counts = store.counts().await?;
    Ok(format!(
        "new        {}\nready      {}\nassigned   {}\ndone       {}\nfailed     {}\nabandoned  {}\ntotal      {}",
        counts.new,
        counts.ready,
        counts.assigned,
        counts.done,
        counts.failed,
        counts.abandoned,
        counts.total(),
    ))
}

pub async fn search(
    store: &Arc<dyn TaskStore>,
    state: Option<TaskState>,
    limit: Option<u32>,
    format: SearchFormat,
) -> Result<String> {
    let tasks = store.query(TaskFilter { state, limit }).await?;
    render(&tasks, format)
}

fn render(tasks: &[Task], format: SearchFormat) -> Result<String> {
    match format {
        SearchFormat::Count => Ok(tasks.len().to_string()),
        SearchFormat::Raw => Ok(tasks
            .iter()
            .map(|task| task.args.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
        SearchFormat::Json => serde_json::to_string_pretty(tasks)
            .map_err(|err| HyperError::Fatal(format!("cannot render tasks: {err}"))),
        SearchFormat::Csv => {
            let mut out = String::from("id,state,attempt,exit_status,host,args\n");
            for task in tasks {
                out.push_str(&format!(
                    "{},{},{},{},{},{}\n",
                    task.id,
                    task.state,
                    task.attempt,
                    task.exit_status.map(|c| c.to_string()).unwrap_or_default(),
                    task.host.as_deref().unwrap_or(""),
                    csv_quote(&task.args),
                ));
            }
            Ok(out.trim_end().to_string())
        }
        SearchFormat::Table => {
            let mut out = format!(
                "{:>8}  {:<9}  {:>7}  {:>4}  {}\n",
                "id", "state", "attempt", "exit", "args"
            );
            for task in tasks {
                out.push_str(&format!(
                    "{:>8}  {:<9}  {:>7}  {:>4}  {}\n",
                    task.id,
                    task.state.to_string(),
                    task.attempt,
                    task.exit_status.map(|c| c.to_string()).unwrap_or_default(),
                    task.args,
                ));
            }
            Ok(out.trim_end().to_string())
        }
    }
}

fn csv_quote(text: &str) -> String {
    if text.contains(',') || text.contains('"') || text.contains('\n') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Poll until the task reaches a terminal state. Returns the final record.
pub async fn wait(store: &Arc<dyn TaskStore>, id: i64, poll: Duration) -> Result<Task> {
    loop {
        let task = store.get(id).await?.ok_or(HyperError::NotFound(id))?;
        if task.is_terminal() {
            return Ok(task);
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewTask};

    async fn seeded_store() -> Arc<dyn TaskStore> {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        for args in ["true", "false", "echo a,b"] {
            store.insert(NewTask::new(args)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn show_renders_json() {
        let store = seeded_store().await;
        let text = show(&store, 1).await.unwrap();
        assert!(text.contains("\"args\": \"true\""));
        assert!(matches!(
            show(&store, 99).await,
            Err(HyperError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn status_counts_states() {
        let store = seeded_store().await;
        let text = status(&store).await.unwrap();
        assert!(text.contains("new        3"));
        assert!(text.contains("total      3"));
    }

    #[tokio::test]
    async fn search_formats() {
        let store = seeded_store().await;
        let count = search(&store, None, None, SearchFormat::Count).await.unwrap();
        assert_eq!(count, "3");

        let raw = search(&store, None, Some(2), SearchFormat::Raw).await.unwrap();
        assert_eq!(raw, "true\nfalse");

        let csv = search(&store, None, None, SearchFormat::Csv).await.unwrap();
        assert!(csv.lines().next().unwrap().starts_with("id,state"));
        assert!(csv.contains("\"echo a,b\""));

        let none = search(&store, Some(TaskState::Done), None, SearchFormat::Count)
            .await
            .unwrap();
        assert_eq!(none, "0");
    }

    #[tokio::test]
    async fn wait_returns_on_terminal() {
        let store = seeded_store().await;
        store.promote_new(1).await.unwrap();
        store.next_ready(1, "w").await.unwrap();
        store
            .update_state(
                1,
                TaskState::Assigned,
                TaskState::Done,
                crate::store::TaskPatch {
                    exit_status: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let task = wait(&store, 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(task.state, TaskState::Done);
    }
}
