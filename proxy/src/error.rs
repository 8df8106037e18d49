use protocol::{DecodeError, FragmentError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("no backend server named {0:?}")]
    NoBackend(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
