use crate::codec::{BufExt, BufMutExt};
use crate::fragment::Fragment;
use crate::{DecodeError, ID_DATA_4, ID_DATA_C};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Type byte plus 24-bit sequence number.
pub const DATAGRAM_HEADER_SIZE: usize = 4;

/// Sequence-numbered container of fragments; the unit of ACK/NAK and retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub kind: u8,
    pub sequence: u32,
    pub fragments: Vec<Fragment>,
}

impl Datagram {
    pub fn new(sequence: u32, fragments: Vec<Fragment>) -> Self {
        let kind = if fragments.iter().any(|f| f.split.is_some()) {
            ID_DATA_C
        } else {
            ID_DATA_4
        };
        Self {
            kind,
            sequence,
            fragments,
        }
    }

    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_SIZE
            + self
                .fragments
                .iter()
                .map(Fragment::encoded_len)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind);
        buf.write_u24_le(self.sequence);
        for fragment in &self.fragments {
            fragment.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Reads fragments until the buffer is exhausted.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut src = data;
        let kind = src.read_u8()?;
        let sequence = src.read_u24_le()?;
        let mut fragments = Vec::new();
        while src.has_remaining() {
            fragments.push(Fragment::decode(&mut src)?);
        }
        Ok(Self {
            kind,
            sequence,
            fragments,
        })
    }
}
