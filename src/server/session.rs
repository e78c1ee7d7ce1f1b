use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BADKEY;
use crate::error::{HyperError, Result};
use crate::protocol::{self, Message, TaskAssignment, PROTOCOL_VERSION};
use crate::server::auth;
use crate::server::ServerShared;

/// Outbound channel depth per session. A client that stops reading fills
/// this and is disconnected rather than blocking dispatch.
const SEND_QUEUE: usize = 64;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the server tracks about one authenticated client.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub client_id: Uuid,
    pub host: String,
    pub sender: mpsc::Sender<Message>,
    pub last_heartbeat: std::time::Instant,
}

/// Drive one client connection from accept to close.
pub async fn run_session(shared: Arc<ServerShared>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut reader, mut writer) = stream.into_split();

    let (client_id, host) = match handshake(&shared, &mut reader, &mut writer).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(peer = %peer, error = %err, "Handshake failed");
            return;
        }
    };
    tracing::info!(client_id = %client_id, host = %host, peer = %peer, "Client connected");

    let (tx, rx) = mpsc::channel::<Message>(SEND_QUEUE);
    // Child of the server's force-close token: server shutdown ends the
    // session; the session ending does not touch the server.
    let closed = shared.stop.child_token();

    shared
        .register_session(SessionHandle {
            client_id,
            host: host.clone(),
            sender: tx.clone(),
            last_heartbeat: std::time::Instant::now(),
        })
        .await;

    let writer_task = tokio::spawn(write_loop(writer, rx, closed.clone()));

    let dispatch_task = {
        let shared = shared.clone();
        let tx = tx.clone();
        let closed = closed.clone();
        let host = host.clone();
        let (request_tx, request_rx) = mpsc::channel::<u32>(16);
        let task = tokio::spawn(dispatch_loop(
            shared, client_id, host, tx, request_rx, closed,
        ));
        (task, request_tx)
    };
    let (dispatch_handle, request_tx) = dispatch_task;

    read_loop(&shared, client_id, &mut reader, &tx, &request_tx, &closed).await;

    // Connection gone (or session force-closed): stop dispatching first,
    // then revoke every lease the client still holds.
    closed.cancel();
    dispatch_handle.abort();
    writer_task.abort();
    shared.deregister_session(client_id).await;
    shared.scheduler.release_client(client_id).await;
    tracing::info!(client_id = %client_id, "Client disconnected");
}

/// HELLO → WELCOME(challenge) → AUTH(mac) → AUTH_OK, with a timeout over
/// the whole exchange.
async fn handshake(
    shared: &ServerShared,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<(Uuid, String)> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (client_id, host) = match protocol::read_message(reader).await? {
            Some(Message::Hello {
                version,
                client_id,
                host,
                ..
            }) => {
                if version != PROTOCOL_VERSION {
                    let reason = format!(
                        "protocol version {version} not supported (server speaks {PROTOCOL_VERSION})"
                    );
                    protocol::write_message(writer, &Message::Reject { reason: reason.clone() })
                        .await?;
                    return Err(HyperError::Transport(reason));
                }
                (client_id, host)
            }
            other => {
                return Err(HyperError::Transport(format!(
                    "expected HELLO, got {other:?}"
                )))
            }
        };

        let challenge = auth::generate_token();
        protocol::write_message(
            writer,
            &Message::Welcome {
                version: PROTOCOL_VERSION,
                challenge: challenge.clone(),
            },
        )
        .await?;

        match protocol::read_message(reader).await? {
            Some(Message::Auth { mac }) => {
                if shared.config.authkey == BADKEY {
                    tracing::warn!("Server is using the default authkey; set -k/--authkey");
                }
                if auth::verify_challenge(&shared.config.authkey, &challenge, &mac) {
                    protocol::write_message(writer, &Message::AuthOk).await?;
                    Ok((client_id, host))
                } else {
                    protocol::write_message(
                        writer,
                        &Message::AuthFail {
                            reason: "bad authkey".to_string(),
                        },
                    )
                    .await?;
                    Err(HyperError::Auth(format!("client {client_id} presented a bad key")))
                }
            }
            other => Err(HyperError::Transport(format!(
                "expected AUTH, got {other:?}"
            ))),
        }
    })
    .await
    .map_err(|_| HyperError::Timeout("handshake timed out".to_string()))?
}

/// Forward queued outbound messages onto the socket.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = protocol::write_message(&mut writer, &message).await {
                    tracing::warn!(error = %err, "Session write failed");
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
}

/// Serve REQUEST messages: lease tasks from the scheduler and push TASKS
/// frames, at most as many tasks as the client asked for. Runs beside the
/// read loop so heartbeats keep flowing while a lease pull waits for work.
async fn dispatch_loop(
    shared: Arc<ServerShared>,
    client_id: Uuid,
    host: String,
    tx: mpsc::Sender<Message>,
    mut requests: mpsc::Receiver<u32>,
    closed: CancellationToken,
) {
    let mut drain = shared.drain_rx.clone();
    loop {
        let max_batch = tokio::select! {
            request = requests.recv() => match request {
                Some(n) => n.max(1) as usize,
                None => return,
            },
            _ = drain.changed() => {
                let deadline = *drain.borrow();
                if let Some(deadline) = deadline {
                    send_shutdown(&tx, deadline, &closed).await;
                }
                continue;
            }
            _ = closed.cancelled() => return,
        };

        // Draining servers stop handing out work; the client will get its
        // SHUTDOWN and wind down.
        if drain.borrow().is_some() {
            continue;
        }

        let leased = tokio::select! {
            leased = shared.scheduler.lease_next(client_id, &host, max_batch) => leased,
            _ = closed.cancelled() => return,
            _ = drain.changed() => {
                let deadline = *drain.borrow();
                if let Some(deadline) = deadline {
                    send_shutdown(&tx, deadline, &closed).await;
                }
                continue;
            }
        };

        match leased {
            Ok(leased) if leased.is_empty() => {
                // Queue closed and drained; nothing more will come.
                continue;
            }
            Ok(leased) => {
                let tasks: Vec<TaskAssignment> = leased
                    .into_iter()
                    .map(|(task, lease)| TaskAssignment {
                        id: task.id,
                        uuid: task.uuid,
                        args: task.args,
                        attempt: task.attempt,
                        env: Default::default(),
                        lease_deadline: lease.deadline,
                    })
                    .collect();
                tracing::debug!(client_id = %client_id, count = tasks.len(), "Dispatching tasks");
                // Non-blocking by design: a full stream means the client
                // stopped reading, and the session is closed instead.
                if tx.try_send(Message::Tasks { tasks }).is_err() {
                    tracing::warn!(client_id = %client_id, "Client send queue full; closing session");
                    closed.cancel();
                    return;
                }
            }
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "Lease pull failed");
                closed.cancel();
                return;
            }
        }
    }
}

async fn send_shutdown(
    tx: &mpsc::Sender<Message>,
    deadline: DateTime<Utc>,
    closed: &CancellationToken,
) {
    if tx
        .send(Message::Shutdown {
            drain_deadline: deadline,
        })
        .await
        .is_err()
    {
        closed.cancel();
    }
}

/// Apply inbound frames until EOF, BYE, or force-close.
async fn read_loop(
    shared: &ServerShared,
    client_id: Uuid,
    reader: &mut OwnedReadHalf,
    tx: &mpsc::Sender<Message>,
    requests: &mpsc::Sender<u32>,
    closed: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = protocol::read_message(reader) => message,
            _ = closed.cancelled() => return,
        };
        match message {
            Ok(Some(Message::Request { max_batch })) => {
                if requests.send(max_batch).await.is_err() {
                    return;
                }
            }
            Ok(Some(Message::Result { outcome })) => {
                shared.apply_result(client_id, outcome).await;
            }
            Ok(Some(Message::Heartbeat { sent_at })) => {
                tracing::trace!(client_id = %client_id, "Heartbeat");
                shared.note_heartbeat(client_id).await;
                let _ = tx.try_send(Message::HeartbeatAck { sent_at });
            }
            Ok(Some(Message::Bye)) | Ok(None) => return,
            Ok(Some(other)) => {
                tracing::warn!(client_id = %client_id, message = ?other, "Unexpected message");
            }
            Err(err) => {
                tracing::warn!(client_id = %client_id, error = %err, "Session read failed");
                return;
            }
        }
    }
}
