//! Line sinks for failed-command args and captured task output.
//!
//! Sessions hand completed lines to an mpsc-fed writer task so the
//! dispatch path never blocks on disk. Lines land in completion order and
//! are flushed one by one.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// Drop everything.
    Null,
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Cheap clonable handle feeding one sink writer.
#[derive(Debug, Clone)]
pub struct LineSink {
    tx: Option<mpsc::Sender<String>>,
}

impl LineSink {
    pub fn null() -> Self {
        Self { tx: None }
    }

    /// Queue one line. Waits if the writer is behind; silently drops on a
    /// null sink or after the writer has gone away.
    pub async fn write(&self, line: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line).await;
        }
    }
}

/// Spawn the writer task for a sink target. The task drains its channel,
/// appends a newline per entry, and flushes after each write; it exits
/// when every `LineSink` clone is dropped.
pub fn spawn_sink(target: SinkTarget) -> (LineSink, Option<JoinHandle<()>>) {
    if matches!(target, SinkTarget::Null) {
        return (LineSink::null(), None);
    }
    let (tx, mut rx) = mpsc::channel::<String>(1024);
    let handle = tokio::spawn(async move {
        let mut writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin> = match target {
            SinkTarget::Null => return,
            SinkTarget::Stdout => Box::new(tokio::io::stdout()),
            SinkTarget::Stderr => Box::new(tokio::io::stderr()),
            SinkTarget::File(path) => match tokio::fs::File::create(&path).await {
                Ok(file) => Box::new(file),
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "Cannot open sink");
                    return;
                }
            },
        };
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                tracing::error!(error = %err, "Sink write failed");
                return;
            }
            if let Err(err) = writer.flush().await {
                tracing::error!(error = %err, "Sink flush failed");
                return;
            }
        }
        let _ = writer.flush().await;
    });
    (LineSink { tx: Some(tx) }, Some(handle))
}
