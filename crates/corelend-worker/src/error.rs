//! Worker supervisor error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors on the control socket.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("timed out waiting for the worker prompt")]
    ReadTimeout,

    #[error("control channel closed by the worker")]
    Closed,

    #[error("control channel is not connected")]
    NotConnected,

    #[error("worker rejected `{command}`: {response}")]
    Rejected { command: String, response: String },

    #[error("`{0}` is not available in file mode")]
    Unsupported(&'static str),

    #[error("control channel i/o: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while driving the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to write worker config {path}: {source}")]
    ArtifactWrite { path: PathBuf, source: io::Error },

    #[error("failed to read worker config {path}: {source}")]
    ArtifactRead { path: PathBuf, source: io::Error },

    #[error("worker config {0} has no cpu slot directive")]
    MissingCoreDirective(PathBuf),

    #[error("failed to spawn worker {binary}: {source}")]
    Spawn { binary: PathBuf, source: io::Error },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
