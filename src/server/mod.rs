//! Dispatch server: accepts authenticated client connections, leases
//! tasks over the framed protocol, and folds results back into the store.

pub mod auth;
mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{HyperError, Result};
use crate::protocol::TaskOutcome;
use crate::scheduler::Scheduler;
use crate::sink::LineSink;
use crate::store::TaskStore;

pub use session::SessionHandle;

/// State shared between the acceptor and every session task.
pub struct ServerShared {
    pub config: ServerConfig,
    pub scheduler: Arc<Scheduler>,
    pub failure_sink: LineSink,
    pub output_sink: LineSink,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    /// Monotonic count of sessions that completed authentication; the
    /// cluster supervisor gates staggered launches on this.
    connected: AtomicU64,
    drain_rx: watch::Receiver<Option<DateTime<Utc>>>,
    /// Cancelled at force-close; every session token is a child of it.
    stop: CancellationToken,
}

impl ServerShared {
    pub async fn register_session(&self, handle: SessionHandle) {
        self.connected.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().await.insert(handle.client_id, handle);
    }

    pub async fn deregister_session(&self, client_id: Uuid) {
        self.sessions.lock().await.remove(&client_id);
    }

    pub async fn note_heartbeat(&self, client_id: Uuid) {
        if let Some(session) = self.sessions.lock().await.get_mut(&client_id) {
            session.last_heartbeat = std::time::Instant::now();
        }
    }

    /// Fold one client-reported outcome into the store and the sinks.
    pub async fn apply_result(&self, client_id: Uuid, outcome: TaskOutcome) {
        let task = match self
            .scheduler
            .complete(
                client_id,
                outcome.id,
                outcome.exit_status,
                outcome.start_time,
                outcome.complete_time,
                outcome.stdout.clone(),
                outcome.stderr.clone(),
            )
            .await
        {
            Ok(task) => task,
            Err(HyperError::Conflict { .. }) | Err(HyperError::Timeout(_)) => {
                // The lease expired and the task moved on before the result
                // arrived; the current holder's outcome wins.
                tracing::warn!(
                    task_id = outcome.id,
                    client_id = %client_id,
                    "Late result dropped"
                );
                return;
            }
            Err(err) => {
                tracing::error!(task_id = outcome.id, error = %err, "Result not recorded");
                return;
            }
        };
        if outcome.exit_status != 0 {
            tracing::warn!(
                task_id = task.id,
                exit_status = outcome.exit_status,
                "Non-zero exit status"
            );
            self.failure_sink.write(task.args.clone()).await;
        }
        if let Some(stdout) = outcome.stdout {
            if !stdout.is_empty() {
                self.output_sink
                    .write(stdout.trim_end_matches('\n').to_string())
                    .await;
            }
        }
    }
}

/// A running dispatch server and its background loops.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub scheduler: Arc<Scheduler>,
    shared: Arc<ServerShared>,
    drain_tx: watch::Sender<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    sink_tasks: Vec<JoinHandle<()>>,
}

/// Bind the listener and spawn the acceptor, promotion loop, and lease
/// reaper. The returned handle owns the ordered-shutdown sequence.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn TaskStore>,
    failure_sink: LineSink,
    output_sink: LineSink,
    sink_tasks: Vec<JoinHandle<()>>,
) -> Result<ServerHandle> {
    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|err| HyperError::Fatal(format!("cannot bind {}: {err}", config.bind)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| HyperError::Fatal(format!("cannot resolve bind address: {err}")))?;

    if config.authkey == crate::config::BADKEY {
        tracing::warn!("No authkey configured; clients must present the default sentinel");
    }

    let scheduler = Arc::new(Scheduler::new(
        store,
        config.maxsize,
        config.max_attempts,
        config.lease_ttl,
    ));
    scheduler.recover().await?;

    let (drain_tx, drain_rx) = watch::channel(None);
    let shutdown = CancellationToken::new();
    let shared = Arc::new(ServerShared {
        config,
        scheduler: scheduler.clone(),
        failure_sink,
        output_sink,
        sessions: Mutex::new(HashMap::new()),
        connected: AtomicU64::new(0),
        drain_rx,
        stop: shutdown.clone(),
    });
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(accept_loop(
        listener,
        shared.clone(),
        shutdown.clone(),
    )));
    {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.run_promoter(token).await;
        }));
    }
    {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.run_reaper(token).await;
        }));
    }

    tracing::info!(addr = %local_addr, "Server listening");
    Ok(ServerHandle {
        local_addr,
        scheduler,
        shared,
        drain_tx,
        shutdown,
        tasks,
        sink_tasks,
    })
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => return,
        };
        match accepted {
            Ok((stream, _)) => {
                let shared = shared.clone();
                tokio::spawn(session::run_session(shared, stream));
            }
            Err(err) => {
                tracing::error!(error = %err, "Accept failed");
            }
        }
    }
}

/// Run a standalone server: optionally submit from an input stream, then
/// serve clients until the work drains (or indefinitely with no source).
/// Returns the process exit code: 0 all done, 4 partial failure.
pub async fn run_server<R>(
    config: ServerConfig,
    source: Option<R>,
    shutdown: CancellationToken,
) -> Result<u8>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let store: Arc<dyn TaskStore> = match &config.database {
        Some(location) => Arc::new(crate::store::SqliteStore::open(location).await?),
        None => Arc::new(crate::store::MemoryStore::new()),
    };
    let (failure_sink, failure_task) = crate::sink::spawn_sink(match &config.failure_path {
        Some(path) => crate::sink::SinkTarget::File(path.clone()),
        None => crate::sink::SinkTarget::Null,
    });
    let (output_sink, output_task) = crate::sink::spawn_sink(match &config.output_path {
        Some(path) => crate::sink::SinkTarget::File(path.clone()),
        None => crate::sink::SinkTarget::Null,
    });
    let sink_tasks = [failure_task, output_task].into_iter().flatten().collect();

    let drain_deadline = config.drain_deadline;
    let handle = start(config, store, failure_sink, output_sink, sink_tasks).await?;

    match source {
        Some(source) => {
            let submitted = tokio::select! {
                submitted = crate::submit::submit_stream(&handle.scheduler, source) => submitted?,
                _ = shutdown.cancelled() => 0,
            };
            if !shutdown.is_cancelled() {
                tracing::info!(count = submitted, "Input exhausted; waiting for tasks to finish");
                handle.wait_drained(&shutdown).await?;
            }
        }
        None => {
            // No input of our own; serve until interrupted.
            shutdown.cancelled().await;
        }
    }

    let scheduler = handle.scheduler.clone();
    handle.shutdown(drain_deadline).await?;
    let counts = scheduler.store().counts().await?;
    tracing::info!(
        done = counts.done,
        failed = counts.failed,
        abandoned = counts.abandoned,
        "Server finished"
    );
    Ok(if counts.failed + counts.abandoned > 0 { 4 } else { 0 })
}

impl ServerHandle {
    /// Sessions that completed authentication since startup (monotonic).
    pub fn connected_count(&self) -> u64 {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Wait until every submitted task reached a terminal state, ticking
    /// against the store. Returns early if `cancel` fires.
    pub async fn wait_drained(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let counts = self.scheduler.store().counts().await?;
            if counts.unfinished() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Ordered shutdown: announce SHUTDOWN with a drain deadline, wait for
    /// clients to finish or the deadline to pass, then force-close
    /// everything and flush the sinks.
    pub async fn shutdown(self, drain: Duration) -> Result<()> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(drain).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let _ = self.drain_tx.send(Some(deadline));
        tracing::info!(%deadline, "Draining clients");

        let wait = tokio::time::timeout(drain + Duration::from_secs(2), async {
            loop {
                if self.shared.sessions.lock().await.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if wait.is_err() {
            tracing::warn!("Drain deadline passed with clients still connected");
        }

        self.scheduler.ready().close();
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
        }

        // Anything still in flight is lost work now.
        let abandoned = self.scheduler.abandon_unfinished().await?;
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "Abandoned unfinished tasks at shutdown");
        }

        // Sessions and the orchestrator hold the only sink handles; with
        // shared state dropped the writers drain and exit.
        drop(self.shared);
        for task in self.sink_tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        Ok(())
    }
}
