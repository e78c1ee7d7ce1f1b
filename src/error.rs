use thiserror::Error;

#[derive(Error, Debug)]
pub enum HyperError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("conflict: task {id} is {actual}, expected {expected}")]
    Conflict {
        id: i64,
        expected: String,
        actual: String,
    },

    #[error("task not found: {0}")]
    NotFound(i64),

    #[error("{0}")]
    Fatal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HyperError {
    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> u8 {
        match self {
            HyperError::Auth(_) => 3,
            HyperError::Parse(_) => 2,
            _ => 1,
        }
    }
}

impl From<sqlx::Error> for HyperError {
    fn from(err: sqlx::Error) -> Self {
        HyperError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for HyperError {
    fn from(err: serde_json::Error) -> Self {
        HyperError::Transport(format!("bad frame payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, HyperError>;
