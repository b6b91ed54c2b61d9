use thiserror::Error;

/// Crate-wide error type. Covers IPC/process boundaries, persisted-storage
/// failures, config decoding, and queue backpressure. `HeuristicResult::NotFound`
/// is deliberately not part of this enum: it is a normal scheduling outcome,
/// not a failure.
#[derive(Debug, Error)]
pub enum DippError {
    #[error("queue is full")]
    QueueFull,

    #[error("module execution timed out")]
    ModuleTimeout,

    #[error("module crashed (abnormal termination, code {code})")]
    ModuleCrash { code: u16 },

    #[error("module exited with error code {code}")]
    ModuleExit { code: u16 },

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config decode error: {0}")]
    ConfigDecode(String),
}

pub type DippResult<T> = Result<T, DippError>;
