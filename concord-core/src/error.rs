use std::net::AddrParseError;

/// Errors surfaced by the consensus engines, the node runtime and the
/// transport/façade layers that drive them.
#[derive(thiserror::Error, Debug)]
pub enum ConcordError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("wrong message family for active algorithm")]
    WrongFamily,

    #[error("not the leader, believed leader: {0:?}")]
    NotLeader(Option<String>),

    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConcordError>;
