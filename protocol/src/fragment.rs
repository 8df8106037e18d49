//! Encapsulated message units carried inside a datagram.

use crate::codec::{BufExt, BufMutExt};
use crate::{DecodeError, Reliability};
use bytes::{Buf, BufMut, Bytes};

const SPLIT_FLAG: u8 = 0x10;

/// Header bytes present on every fragment: flags + bit length.
pub const BASE_HEADER_SIZE: usize = 3;
pub const RELIABLE_HEADER_SIZE: usize = 3;
pub const ORDERED_HEADER_SIZE: usize = 4;
pub const SPLIT_HEADER_SIZE: usize = 10;
/// Largest payload whose bit length fits the 16-bit length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub part_count: u32,
    pub part_id: u16,
    pub part_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub reliability: Reliability,
    pub reliable_index: u32,
    pub ordering_index: u32,
    pub ordering_channel: u8,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(reliability: Reliability, payload: Bytes) -> Self {
        Self {
            reliability,
            reliable_index: 0,
            ordering_index: 0,
            ordering_channel: 0,
            split: None,
            payload,
        }
    }

    pub fn header_len(&self) -> usize {
        let mut len = BASE_HEADER_SIZE;
        if self.reliability.is_reliable() {
            len += RELIABLE_HEADER_SIZE;
        }
        if self.reliability.is_sequenced_or_ordered() {
            len += ORDERED_HEADER_SIZE;
        }
        if self.split.is_some() {
            len += SPLIT_HEADER_SIZE;
        }
        len
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut flags = (self.reliability as u8) << 5;
        if self.split.is_some() {
            flags |= SPLIT_FLAG;
        }
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_SIZE,
            "fragment payload of {} bytes overflows the bit length field",
            self.payload.len()
        );
        dst.put_u8(flags);
        dst.put_u16((self.payload.len() * 8) as u16);

        if self.reliability.is_reliable() {
            dst.write_u24_le(self.reliable_index);
        }
        if self.reliability.is_sequenced_or_ordered() {
            dst.write_u24_le(self.ordering_index);
            dst.put_u8(self.ordering_channel);
        }
        if let Some(split) = &self.split {
            dst.put_u32(split.part_count);
            dst.put_u16(split.part_id);
            dst.put_u32(split.part_index);
        }
        dst.put_slice(&self.payload);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let flags = src.read_u8()?;
        let reliability = Reliability::from_bits(flags >> 5)?;
        let bits = src.read_u16()? as usize;
        let len = bits.div_ceil(8);

        let mut fragment = Fragment::new(reliability, Bytes::new());
        if reliability.is_reliable() {
            fragment.reliable_index = src.read_u24_le()?;
        }
        if reliability.is_sequenced_or_ordered() {
            fragment.ordering_index = src.read_u24_le()?;
            fragment.ordering_channel = src.read_u8()?;
        }
        if flags & SPLIT_FLAG != 0 {
            fragment.split = Some(SplitInfo {
                part_count: src.read_u32()?,
                part_id: src.read_u16()?,
                part_index: src.read_u32()?,
            });
        }
        fragment.payload = src.read_slice(len)?;
        Ok(fragment)
    }
}

/// Concatenates the payloads of an ordered set of split parts.
pub fn join_payloads(parts: &[Fragment]) -> Bytes {
    let total = parts.iter().map(|p| p.payload.len()).sum();
    let mut joined = Vec::with_capacity(total);
    for part in parts {
        joined.extend_from_slice(&part.payload);
    }
    Bytes::from(joined)
}
