use crate::DecodeError;

/// Delivery class carried in the top three bits of a fragment's flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        Ok(match bits {
            0 => Reliability::Unreliable,
            1 => Reliability::UnreliableSequenced,
            2 => Reliability::Reliable,
            3 => Reliability::ReliableOrdered,
            4 => Reliability::ReliableSequenced,
            5 => Reliability::UnreliableWithAckReceipt,
            6 => Reliability::ReliableWithAckReceipt,
            7 => Reliability::ReliableOrderedWithAckReceipt,
            other => return Err(DecodeError::InvalidReliability(other)),
        })
    }

    /// Kinds that carry a 24-bit reliability number.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    /// Kinds that carry an ordering index and channel.
    pub fn is_sequenced_or_ordered(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits_covers_all_kinds() {
        for bits in 0..8u8 {
            assert_eq!(Reliability::from_bits(bits).unwrap() as u8, bits);
        }
        assert_eq!(
            Reliability::from_bits(8),
            Err(DecodeError::InvalidReliability(8))
        );
    }

    #[test]
    fn test_reliable_kinds() {
        assert!(!Reliability::Unreliable.is_reliable());
        assert!(!Reliability::UnreliableSequenced.is_reliable());
        assert!(!Reliability::UnreliableWithAckReceipt.is_reliable());
        assert!(Reliability::Reliable.is_reliable());
        assert!(Reliability::ReliableOrderedWithAckReceipt.is_reliable());
    }

    #[test]
    fn test_ordered_kinds() {
        assert!(Reliability::UnreliableSequenced.is_sequenced_or_ordered());
        assert!(Reliability::ReliableOrdered.is_sequenced_or_ordered());
        assert!(!Reliability::Reliable.is_sequenced_or_ordered());
        assert!(!Reliability::ReliableWithAckReceipt.is_sequenced_or_ordered());
    }
}
