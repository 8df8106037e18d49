use thiserror::Error;

/// Failure to parse bytes received from the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },
    #[error("offline message magic mismatch")]
    InvalidMagic,
    #[error("unexpected packet id: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedId { expected: u8, found: u8 },
    #[error("invalid reliability kind {0}")]
    InvalidReliability(u8),
    #[error("unsupported address version {0}")]
    InvalidAddressVersion(u8),
    #[error("string is not valid utf-8")]
    InvalidString,
    #[error("invalid length field {0}")]
    InvalidLength(i64),
    #[error("failed to decompress batch: {0}")]
    Decompress(String),
    #[error("batch expands beyond {limit} bytes")]
    BatchTooLarge { limit: usize },
}

/// Failure to cut an outbound message into datagrams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("mtu {mtu} leaves no room for payload")]
    MtuTooSmall { mtu: u16 },
    #[error("datagram too big: fragment of {size} bytes exceeds budget of {budget}")]
    FragmentTooLarge { size: usize, budget: usize },
}
