//! ACK/NAK packets and the range compression of sequence numbers they carry.

use crate::codec::{BufExt, BufMutExt};
use crate::{DecodeError, ID_ACK, ID_NAK};
use bytes::{BufMut, Bytes, BytesMut};

const RECORD_RANGE: u8 = 0;
const RECORD_SINGLE: u8 = 1;

/// Inclusive span of datagram sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: u32,
    pub max: u32,
}

impl Range {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn single(value: u32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn is_single(&self) -> bool {
        self.min == self.max
    }

    pub fn contains(&self, value: u32) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Collapses a sorted, de-duplicated list into maximal consecutive runs.
pub fn compress(sorted: &[u32]) -> Vec<Range> {
    let mut ranges: Vec<Range> = Vec::new();
    for &value in sorted {
        match ranges.last_mut() {
            Some(last) if last.max.checked_add(1) == Some(value) => last.max = value,
            Some(last) if last.max == value => {}
            _ => ranges.push(Range::single(value)),
        }
    }
    ranges
}

pub fn expand(ranges: &[Range]) -> Vec<u32> {
    ranges.iter().flat_map(|r| r.min..=r.max).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nak,
}

impl AckKind {
    pub fn id(self) -> u8 {
        match self {
            AckKind::Ack => ID_ACK,
            AckKind::Nak => ID_NAK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub kind: AckKind,
    pub ranges: Vec<Range>,
}

impl AckPacket {
    pub fn ack(ranges: Vec<Range>) -> Self {
        Self {
            kind: AckKind::Ack,
            ranges,
        }
    }

    pub fn nak(ranges: Vec<Range>) -> Self {
        Self {
            kind: AckKind::Nak,
            ranges,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.ranges.len() * 7);
        buf.put_u8(self.kind.id());
        buf.put_u16(self.ranges.len() as u16);
        for range in &self.ranges {
            if range.is_single() {
                buf.put_u8(RECORD_SINGLE);
                buf.write_u24_le(range.min);
            } else {
                buf.put_u8(RECORD_RANGE);
                buf.write_u24_le(range.min);
                buf.write_u24_le(range.max);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut src = data;
        let kind = match src.read_u8()? {
            ID_ACK => AckKind::Ack,
            ID_NAK => AckKind::Nak,
            found => {
                return Err(DecodeError::UnexpectedId {
                    expected: ID_ACK,
                    found,
                })
            }
        };
        let count = src.read_u16()?;
        let mut ranges = Vec::with_capacity(count.min(512) as usize);
        for _ in 0..count {
            let range = if src.read_u8()? == RECORD_SINGLE {
                Range::single(src.read_u24_le()?)
            } else {
                let min = src.read_u24_le()?;
                let max = src.read_u24_le()?;
                if max < min {
                    return Err(DecodeError::InvalidLength(i64::from(max) - i64::from(min)));
                }
                Range::new(min, max)
            };
            ranges.push(range);
        }
        Ok(Self { kind, ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    #[test]
    fn test_compress_runs() {
        let ranges = compress(&[1, 2, 3, 5, 7, 8]);
        assert_eq!(
            ranges,
            vec![Range::new(1, 3), Range::single(5), Range::new(7, 8)]
        );
    }

    #[test]
    fn test_compress_empty() {
        assert!(compress(&[]).is_empty());
        assert!(expand(&[]).is_empty());
    }

    #[test]
    fn test_expand_inverts_compress() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let set: BTreeSet<u32> = (0..rng.gen_range(1..64))
                .map(|_| rng.gen_range(0..256))
                .collect();
            let sorted: Vec<u32> = set.into_iter().collect();
            assert_eq!(expand(&compress(&sorted)), sorted);
        }
    }

    #[test]
    fn test_ack_wire_format() {
        let packet = AckPacket::ack(vec![Range::single(5), Range::new(1, 3)]);
        let encoded = packet.encode();
        assert_eq!(
            &encoded[..],
            &[ID_ACK, 0, 2, 1, 5, 0, 0, 0, 1, 0, 0, 3, 0, 0]
        );
        assert_eq!(AckPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_nak_uses_nak_id() {
        let packet = AckPacket::nak(vec![Range::single(9)]);
        let encoded = packet.encode();
        assert_eq!(encoded[0], ID_NAK);
        assert_eq!(AckPacket::decode(&encoded).unwrap().kind, AckKind::Nak);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let raw = [ID_ACK, 0, 1, 0, 5, 0, 0, 1, 0, 0];
        assert!(AckPacket::decode(&raw).is_err());
    }

    #[test]
    fn test_truncated_ack_rejected() {
        let raw = [ID_ACK, 0, 2, 1, 5, 0, 0];
        assert!(AckPacket::decode(&raw).is_err());
    }
}
