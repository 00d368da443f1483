use crate::command::CommandError;
use crate::replication::ReplicationError;
use crate::resp::RespError;

/// Crate-level error, wrapping the per-layer kinds.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("framing error: {0}")]
    Resp(#[from] RespError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
