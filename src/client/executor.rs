use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::protocol::{TaskAssignment, TaskOutcome};
use crate::template::Template;

/// Exit statuses fabricated by the client when the command never ran (or
/// never finished): template expansion failed, the shell could not be
/// spawned, or the task was killed at the drain deadline.
pub const EXIT_KILLED: i32 = -1;
pub const EXIT_EXPANSION_FAILED: i32 = -2;
pub const EXIT_SPAWN_FAILED: i32 = -3;

/// Per-client execution context shared by every running task.
#[derive(Debug)]
pub struct TaskContext {
    pub template: Template,
    pub capture: bool,
    pub host: String,
    /// `HYPERSHELL_EXPORT_*` variables, prefix stripped.
    pub task_env: BTreeMap<String, String>,
    /// `HYPERSHELL_CWD`, when set.
    pub workdir: Option<PathBuf>,
    pub output: Option<std::fs::File>,
    pub errors: Option<std::fs::File>,
}

/// Run one task through the shell and report its outcome. Cancelling
/// `drain` kills the child and reports `EXIT_KILLED`.
pub async fn run_task(
    ctx: &TaskContext,
    assignment: TaskAssignment,
    drain: CancellationToken,
) -> TaskOutcome {
    let start_time = Utc::now();
    let outcome = |exit_status: i32, stdout: Option<String>, stderr: Option<String>| TaskOutcome {
        id: assignment.id,
        exit_status,
        start_time: Some(start_time),
        complete_time: Some(Utc::now()),
        stdout,
        stderr,
    };

    let command = match ctx.template.expand(&assignment.args, &ctx.task_env).await {
        Ok(command) => command,
        Err(err) => {
            tracing::error!(task_id = assignment.id, error = %err, "Template expansion failed");
            return outcome(EXIT_EXPANSION_FAILED, None, Some(err.to_string()));
        }
    };
    tracing::info!(task_id = assignment.id, command = %command, "Running task");

    let (shell, flag) = crate::template::shell();
    let mut cmd = tokio::process::Command::new(shell);
    cmd.arg(flag)
        .arg(&command)
        .stdin(Stdio::null())
        .envs(&ctx.task_env)
        .envs(&assignment.env)
        .env("TASK_ID", assignment.id.to_string())
        .env("TASK_ARGS", &assignment.args)
        .env("TASK_ATTEMPT", assignment.attempt.to_string())
        .env("TASK_HOST", &ctx.host);
    if let Some(workdir) = &ctx.workdir {
        cmd.current_dir(workdir);
    }

    if ctx.capture {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(redirect(&ctx.output)).stderr(redirect(&ctx.errors));
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(task_id = assignment.id, error = %err, "Cannot spawn shell");
            return outcome(EXIT_SPAWN_FAILED, None, Some(err.to_string()));
        }
    };

    // Drain the pipes while waiting so a chatty child never deadlocks on a
    // full pipe buffer.
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = tokio::select! {
        status = child.wait() => status,
        _ = drain.cancelled() => {
            tracing::warn!(task_id = assignment.id, "Drain deadline reached; killing task");
            let _ = child.kill().await;
            return outcome(EXIT_KILLED, None, None);
        }
    };

    let stdout = collect(stdout_reader, ctx.capture).await;
    let stderr = collect(stderr_reader, ctx.capture).await;

    match status {
        Ok(status) => {
            let exit_status = status.code().unwrap_or(EXIT_KILLED);
            tracing::info!(task_id = assignment.id, exit_status, "Task finished");
            outcome(exit_status, stdout, stderr)
        }
        Err(err) => {
            tracing::error!(task_id = assignment.id, error = %err, "Wait failed");
            outcome(EXIT_SPAWN_FAILED, stdout, Some(err.to_string()))
        }
    }
}

fn redirect(target: &Option<std::fs::File>) -> Stdio {
    match target {
        Some(file) => match file.try_clone() {
            Ok(clone) => Stdio::from(clone),
            Err(_) => Stdio::inherit(),
        },
        None => Stdio::inherit(),
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<tokio::task::JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer).await;
            buffer
        })
    })
}

async fn collect(
    reader: Option<tokio::task::JoinHandle<Vec<u8>>>,
    capture: bool,
) -> Option<String> {
    let reader = reader?;
    let bytes = reader.await.unwrap_or_default();
    if capture {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context(capture: bool) -> TaskContext {
        TaskContext {
            template: Template::parse("{}").unwrap(),
            capture,
            host: "testhost".to_string(),
            task_env: BTreeMap::new(),
            workdir: None,
            output: None,
            errors: None,
        }
    }

    fn assignment(args: &str) -> TaskAssignment {
        TaskAssignment {
            id: 1,
            uuid: Uuid::new_v4(),
            args: args.to_string(),
            attempt: 1,
            env: BTreeMap::new(),
            lease_deadline: Utc::now() + chrono::Duration::seconds(300),
        }
    }

    #[tokio::test]
    async fn zero_exit_reported() {
        let outcome = run_task(&context(false), assignment("true"), CancellationToken::new()).await;
        assert_eq!(outcome.exit_status, 0);
        assert!(outcome.start_time.unwrap() <= outcome.complete_time.unwrap());
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let outcome = run_task(&context(false), assignment("exit 7"), CancellationToken::new()).await;
        assert_eq!(outcome.exit_status, 7);
    }

    #[tokio::test]
    async fn capture_collects_stdout() {
        let outcome = run_task(
            &context(true),
            assignment("echo hello; echo oops >&2"),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.exit_status, 0);
        assert_eq!(outcome.stdout.as_deref(), Some("hello\n"));
        assert_eq!(outcome.stderr.as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn task_env_and_bindings_visible() {
        let mut ctx = context(true);
        ctx.task_env.insert("FOO".to_string(), "bar".to_string());
        let outcome = run_task(
            &ctx,
            assignment("echo $FOO $TASK_ID $TASK_ATTEMPT"),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.stdout.as_deref(), Some("bar 1 1\n"));
    }

    #[tokio::test]
    async fn expansion_failure_skips_execution() {
        let mut ctx = context(true);
        ctx.template = Template::parse("echo {[9]}").unwrap();
        let outcome = run_task(&ctx, assignment("a b"), CancellationToken::new()).await;
        assert_eq!(outcome.exit_status, EXIT_EXPANSION_FAILED);
        assert!(outcome.stderr.unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn drain_kills_running_task() {
        let drain = CancellationToken::new();
        let killer = {
            let drain = drain.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                drain.cancel();
            })
        };
        let started = std::time::Instant::now();
        let outcome = run_task(&context(false), assignment("sleep 30"), drain).await;
        killer.await.unwrap();
        assert_eq!(outcome.exit_status, EXIT_KILLED);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
