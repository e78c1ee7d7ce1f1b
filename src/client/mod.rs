//! Client executor: one long-lived worker process per invocation.
//!
//! Lifecycle: connect and authenticate, then keep at most `--num-tasks`
//! tasks outstanding by sending REQUEST as slots free up. Each task runs
//! through the local shell with the template applied client-side, so mixed
//! clients can serve one server. On SHUTDOWN the client stops requesting,
//! lets running tasks finish until the drain deadline, then kills the
//! remainder and reports them with a killed exit status.

pub mod executor;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{self, ClientConfig};
use crate::error::{HyperError, Result};
use crate::protocol::{self, Message, TaskOutcome, PROTOCOL_VERSION};
use crate::server::auth;
use crate::template::Template;

use executor::TaskContext;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connect, authenticate, and work until the server says BYE, the idle
/// timeout fires, or the drain completes.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let template = Template::parse(&config.template)?;
    let client_id = Uuid::new_v4();
    let host = config::hostname();

    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|err| {
            HyperError::Transport(format!(
                "cannot connect to {}:{}: {err}",
                config.host, config.port
            ))
        })?;
    let (mut reader, mut writer) = stream.into_split();

    // HELLO → WELCOME(challenge) → AUTH(mac) → AUTH_OK.
    protocol::write_message(
        &mut writer,
        &Message::Hello {
            version: PROTOCOL_VERSION,
            client_id,
            host: host.clone(),
            capabilities: 0,
        },
    )
    .await?;
    let challenge = match protocol::read_message(&mut reader).await? {
        Some(Message::Welcome { challenge, .. }) => challenge,
        Some(Message::Reject { reason }) => return Err(HyperError::Transport(reason)),
        other => {
            return Err(HyperError::Transport(format!(
                "expected WELCOME, got {other:?}"
            )))
        }
    };
    protocol::write_message(
        &mut writer,
        &Message::Auth {
            mac: auth::sign_challenge(&config.authkey, &challenge),
        },
    )
    .await?;
    match protocol::read_message(&mut reader).await? {
        Some(Message::AuthOk) => {}
        Some(Message::AuthFail { reason }) => return Err(HyperError::Auth(reason)),
        other => {
            return Err(HyperError::Transport(format!(
                "expected AUTH_OK, got {other:?}"
            )))
        }
    }
    tracing::info!(client_id = %client_id, host = %host, "Connected");

    let ctx = Arc::new(TaskContext {
        template,
        capture: config.capture,
        host,
        task_env: config::load_task_env(),
        workdir: std::env::var("HYPERSHELL_CWD").ok().map(Into::into),
        output: open_redirect(&config.output_path)?,
        errors: open_redirect(&config.errors_path)?,
    });

    let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(64);
    let drain = CancellationToken::new();
    let capacity = config.num_tasks.max(1);
    let mut outstanding: usize = 0;
    let mut draining = false;

    // Frames are read on their own task so the select loop below never
    // drops a read mid-frame.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Option<Message>>>(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = protocol::read_message(&mut reader).await;
            let last = !matches!(frame, Ok(Some(_)));
            if frame_tx.send(frame).await.is_err() || last {
                return;
            }
        }
    });

    protocol::write_message(
        &mut writer,
        &Message::Request {
            max_batch: capacity as u32,
        },
    )
    .await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let idle_deadline = last_activity + effective_timeout(config.timeout);
        tokio::select! {
            frame = frame_rx.recv() => {
                let message = match frame {
                    Some(frame) => frame?,
                    None => break,
                };
                match message {
                    Some(Message::Tasks { tasks }) => {
                        last_activity = tokio::time::Instant::now();
                        for assignment in tasks {
                            outstanding += 1;
                            let ctx = ctx.clone();
                            let drain = drain.clone();
                            let result_tx = result_tx.clone();
                            tokio::spawn(async move {
                                let outcome = executor::run_task(&ctx, assignment, drain).await;
                                let _ = result_tx.send(outcome).await;
                            });
                        }
                    }
                    Some(Message::Shutdown { drain_deadline }) => {
                        tracing::info!(%drain_deadline, "Shutdown requested; draining");
                        draining = true;
                        if outstanding == 0 {
                            break;
                        }
                        let drain = drain.clone();
                        let wait = (drain_deadline - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        tokio::spawn(async move {
                            tokio::time::sleep(wait).await;
                            drain.cancel();
                        });
                    }
                    Some(Message::HeartbeatAck { .. }) => {}
                    Some(Message::Bye) | None => {
                        tracing::info!("Server closed the session");
                        break;
                    }
                    Some(other) => {
                        tracing::warn!(message = ?other, "Unexpected message");
                    }
                }
            }
            outcome = result_rx.recv() => {
                let Some(outcome) = outcome else { break };
                outstanding = outstanding.saturating_sub(1);
                protocol::write_message(&mut writer, &Message::Result { outcome }).await?;
                if draining {
                    if outstanding == 0 {
                        break;
                    }
                } else {
                    let free = capacity.saturating_sub(outstanding).max(1);
                    protocol::write_message(&mut writer, &Message::Request {
                        max_batch: free as u32,
                    }).await?;
                }
            }
            _ = heartbeat.tick() => {
                protocol::write_message(&mut writer, &Message::Heartbeat { sent_at: Utc::now() })
                    .await?;
            }
            _ = tokio::time::sleep_until(idle_deadline),
                if !config.timeout.is_zero() && outstanding == 0 && !draining =>
            {
                tracing::info!(timeout = ?config.timeout, "No work arrived; disconnecting");
                break;
            }
        }
    }

    let _ = protocol::write_message(&mut writer, &Message::Bye).await;
    reader_task.abort();
    tracing::info!(client_id = %client_id, "Done");
    Ok(())
}

/// Zero means "wait forever": pick a deadline far enough out that the
/// select arm never wins.
fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        timeout
    }
}

fn open_redirect(path: &Option<std::path::PathBuf>) -> Result<Option<std::fs::File>> {
    match path {
        Some(path) => Ok(Some(std::fs::File::create(path)?)),
        None => Ok(None),
    }
}
