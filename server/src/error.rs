//! Error types for the burrow server.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel agent already started")]
    AlreadyStarted,

    #[error("tunnel agent closed")]
    AgentClosed,

    #[error("no available ports")]
    NoAvailablePorts,

    #[error("subdomain \"{id}\" is reserved by another client")]
    Reserved { id: String, remaining_secs: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
