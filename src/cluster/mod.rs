//! Cluster supervisor: one invocation that runs the server in-process,
//! launches N clients (local children, SSH, or MPI), feeds the input
//! stream, and performs the ordered shutdown.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{self, ClusterConfig, Launcher, BADKEY};
use crate::error::{HyperError, Result};
use crate::server::{self, auth, ServerHandle};
use crate::sink::{spawn_sink, SinkTarget};
use crate::store::{MemoryStore, SqliteStore, TaskStore};
use crate::submit;

/// How long to wait for each launched client's HELLO before moving on.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between successive client launches.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(100);

/// Run a full cluster until the input is drained (or the token fires).
/// Returns the process exit code: 0 all done, 4 partial failure.
pub async fn run_cluster<R>(
    mut config: ClusterConfig,
    source: R,
    shutdown: CancellationToken,
) -> Result<u8>
where
    R: AsyncBufRead + Unpin,
{
    // Clusters never run on the sentinel key; autogenerate a 128-bit one.
    if config.server.authkey == BADKEY {
        config.server.authkey = auth::generate_token();
        tracing::debug!("Autogenerated cluster authkey");
    }

    let store: Arc<dyn TaskStore> = match &config.server.database {
        Some(location) => Arc::new(SqliteStore::open(location).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let (failure_sink, failure_task) = spawn_sink(match &config.server.failure_path {
        Some(path) => SinkTarget::File(path.clone()),
        None => SinkTarget::Null,
    });
    let (output_sink, output_task) = spawn_sink(match &config.server.output_path {
        Some(path) => SinkTarget::File(path.clone()),
        None if config.capture => SinkTarget::Stdout,
        None => SinkTarget::Null,
    });
    let sink_tasks = [failure_task, output_task].into_iter().flatten().collect();

    let drain_deadline = config.server.drain_deadline;
    let handle = server::start(
        config.server.clone(),
        store,
        failure_sink,
        output_sink,
        sink_tasks,
    )
    .await?;

    let mut clients = launch_clients(&config, &handle).await?;

    // Feed the input; the bounded ready queue provides backpressure.
    let submitted = tokio::select! {
        submitted = submit::submit_stream(&handle.scheduler, source) => submitted?,
        _ = shutdown.cancelled() => {
            tracing::warn!("Interrupted during submission");
            0
        }
    };

    if !shutdown.is_cancelled() {
        tracing::info!(count = submitted, "Input exhausted; waiting for tasks to finish");
        handle.wait_drained(&shutdown).await?;
    }

    let scheduler = handle.scheduler.clone();
    handle.shutdown(drain_deadline).await?;
    reap_clients(&mut clients, drain_deadline).await;

    let counts = scheduler.store().counts().await?;
    tracing::info!(
        done = counts.done,
        failed = counts.failed,
        abandoned = counts.abandoned,
        "Cluster finished"
    );
    Ok(if counts.failed + counts.abandoned > 0 { 4 } else { 0 })
}

/// Spawn the configured clients with staggered startup: a bounded delay
/// between launches, each gated on the previous client's HELLO arriving.
async fn launch_clients(config: &ClusterConfig, handle: &ServerHandle) -> Result<Vec<Child>> {
    let exe = config::executable();
    let port = handle.local_addr.port();
    let mut clients = Vec::new();

    match &config.launcher {
        Launcher::Local { num_clients } => {
            let num_clients = if *num_clients == 0 {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            } else {
                *num_clients
            };
            tracing::info!(count = num_clients, "Launching local clients");
            for index in 0..num_clients {
                let mut command = Command::new(&exe);
                command.args(client_args(config, "127.0.0.1", port));
                clients.push(spawn_client(command, &format!("local-{index}"))?);
                stagger(config, handle, clients.len() as u64).await;
            }
        }
        Launcher::Ssh { nodefile } => {
            let hosts = std::fs::read_to_string(nodefile)
                .map_err(|err| HyperError::Fatal(format!("cannot read {}: {err}", nodefile.display())))?;
            let server_host = config::hostname();
            for host in hosts.lines().map(str::trim).filter(|host| !host.is_empty()) {
                tracing::info!(host = %host, "Launching SSH client");
                let remote = client_args(config, &server_host, port)
                    .into_iter()
                    .map(|arg| shell_quote(&arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut command = Command::new("ssh");
                command.arg(host).arg(format!("{} {}", shell_quote(&exe), remote));
                clients.push(spawn_client(command, host)?);
                stagger(config, handle, clients.len() as u64).await;
            }
        }
        Launcher::Mpi { machinefile } => {
            tracing::info!(machinefile = %machinefile.display(), "Launching MPI clients");
            let mut command = Command::new("mpiexec");
            command
                .arg("-machinefile")
                .arg(machinefile)
                .arg(&exe)
                .args(client_args(config, &config::hostname(), port));
            clients.push(spawn_client(command, "mpiexec")?);
        }
    }
    Ok(clients)
}

fn client_args(config: &ClusterConfig, host: &str, port: u16) -> Vec<String> {
    let mut args = vec![
        "client".to_string(),
        "-H".to_string(),
        host.to_string(),
        "-p".to_string(),
        port.to_string(),
        "-k".to_string(),
        config.server.authkey.clone(),
        "--num-tasks".to_string(),
        config.num_tasks.to_string(),
        "-t".to_string(),
        config.template.clone(),
    ];
    if config.capture {
        args.push("--capture".to_string());
    }
    args
}

fn spawn_client(mut command: Command, label: &str) -> Result<Child> {
    command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| HyperError::Fatal(format!("cannot launch client {label}: {err}")))
}

/// Bounded pause after each launch, plus a wait for the HELLO count to
/// reach the number of clients launched so far. Prevents a thundering
/// herd of connections on large clusters.
async fn stagger(config: &ClusterConfig, handle: &ServerHandle, expected: u64) {
    tokio::time::sleep(config.stagger).await;
    let gate = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while handle.connected_count() < expected {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if gate.is_err() {
        tracing::warn!(expected, "Client did not connect in time; continuing");
    }
}

/// Give launched clients until the drain deadline to exit, then kill.
async fn reap_clients(clients: &mut [Child], drain: Duration) {
    for child in clients.iter_mut() {
        match tokio::time::timeout(drain + Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(status = %status, "Client exited");
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Client wait failed");
            }
            Err(_) => {
                tracing::warn!("Client did not exit; killing");
                let _ = child.kill().await;
            }
        }
    }
}

fn shell_quote(text: &str) -> String {
    if !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}
