use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    New,
    Ready,
    Assigned,
    Done,
    Failed,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Abandoned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Ready => "ready",
            TaskState::Assigned => "assigned",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Abandoned => "abandoned",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "new" => Some(TaskState::New),
            "ready" => Some(TaskState::Ready),
            "assigned" => Some(TaskState::Assigned),
            "done" => Some(TaskState::Done),
            "failed" => Some(TaskState::Failed),
            "abandoned" => Some(TaskState::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uuid: Uuid,
    pub args: String,
    pub template: String,
    pub state: TaskState,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub attempt: u32,
    pub exit_status: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A task as submitted, before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub uuid: Uuid,
    pub args: String,
    pub template: String,
    pub submit_time: DateTime<Utc>,
}

impl NewTask {
    pub fn new(args: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            args: args.into(),
            template: crate::template::DEFAULT_TEMPLATE.to_string(),
            submit_time: Utc::now(),
        }
    }
}

/// Fields written alongside a compare-and-swap state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub host: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskPatch {
    pub fn assigned(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }
}

/// Outcome of a `requeue` call.
#[derive(Debug, Clone)]
pub enum Requeued {
    /// Attempts remained; the task is READY again with `attempt` bumped.
    Ready(Task),
    /// Attempts were exhausted; the task is now ABANDONED.
    Abandoned(Task),
}

/// Read-only query filter for the reporting CLI.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Abandoned.is_terminal());
        assert!(!TaskState::New.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
        assert!(!TaskState::Assigned.is_terminal());
    }

    #[test]
    fn state_text_roundtrip() {
        for state in [
            TaskState::New,
            TaskState::Ready,
            TaskState::Assigned,
            TaskState::Done,
            TaskState::Failed,
            TaskState::Abandoned,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }
}
