//! Framed wire protocol between the dispatch server and clients.
//!
//! Every frame is a u32 big-endian length prefix followed by a JSON
//! message body. The protocol version is negotiated in HELLO/WELCOME so
//! cross-platform clients stay possible; a mismatched major version is
//! rejected before authentication.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{HyperError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is a corrupt stream.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// One task handed to a client for execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub id: i64,
    pub uuid: Uuid,
    pub args: String,
    pub attempt: u32,
    /// Server-side additions to the task environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub lease_deadline: DateTime<Utc>,
}

/// A finished (or failed-to-run) task reported back by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub id: i64,
    pub exit_status: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        version: u32,
        client_id: Uuid,
        host: String,
        capabilities: u32,
    },
    Welcome {
        version: u32,
        challenge: String,
    },
    Reject {
        reason: String,
    },
    Auth {
        mac: String,
    },
    AuthOk,
    AuthFail {
        reason: String,
    },
    Request {
        max_batch: u32,
    },
    Tasks {
        tasks: Vec<TaskAssignment>,
    },
    Result {
        outcome: TaskOutcome,
    },
    Heartbeat {
        sent_at: DateTime<Utc>,
    },
    HeartbeatAck {
        sent_at: DateTime<Utc>,
    },
    Shutdown {
        drain_deadline: DateTime<Utc>,
    },
    Bye,
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)
        .map_err(|err| HyperError::Transport(format!("cannot encode frame: {err}")))?;
    if body.len() > MAX_FRAME {
        return Err(HyperError::Transport(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` is a clean EOF at a frame boundary;
/// a truncated frame is a transport error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_FRAME {
        return Err(HyperError::Transport(format!(
            "frame of {length} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| HyperError::Transport(format!("truncated frame: {err}")))?;
    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}
