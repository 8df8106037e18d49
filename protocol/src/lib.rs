//! RakNet transport and MCPE wire formats shared by the proxy and its tools.
//!
//! The crate is runtime-free: every type here works on byte buffers and
//! explicit `Instant`s, leaving sockets and tasks to the caller.

pub mod ack;
pub mod codec;
pub mod datagram;
pub mod error;
pub mod fragment;
pub mod fragmenter;
pub mod link;
pub mod mcpe;
pub mod raknet;
pub mod reliability;
pub mod retransmit;
pub mod split;

pub use ack::{AckKind, AckPacket, Range};
pub use datagram::Datagram;
pub use error::{DecodeError, FragmentError};
pub use fragment::{Fragment, SplitInfo};
pub use fragmenter::{Fragmenter, SequenceCounter};
pub use link::ReliableLink;
pub use raknet::Packet;
pub use reliability::Reliability;
pub use retransmit::{RetransmissionTracker, RetransmitPlan};
pub use split::SplitAssembler;

pub const ID_CONNECTED_PING: u8 = 0x00;
pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
pub const ID_CONNECTED_PONG: u8 = 0x03;
pub const ID_OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const ID_OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const ID_OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const ID_OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const ID_CONNECTION_REQUEST: u8 = 0x09;
pub const ID_CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
pub const ID_NEW_INCOMING_CONNECTION: u8 = 0x13;
pub const ID_NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
pub const ID_DISCONNECT_NOTIFICATION: u8 = 0x15;
pub const ID_CONNECTION_BANNED: u8 = 0x17;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;
pub const ID_USER_PACKET_ENUM: u8 = 0x86;

pub const ID_DATA_4: u8 = 0x84;
pub const ID_DATA_C: u8 = 0x8c;
pub const ID_NAK: u8 = 0xa0;
pub const ID_ACK: u8 = 0xc0;

pub const RAKNET_PROTOCOL_VERSION: u8 = 7;

pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// IP + UDP header bytes not visible to the application.
///
/// Exactly 20 + 8 for IPv4, rather than the +32 padding heuristic.
pub const UDP_HEADER_OVERHEAD: u16 = 28;
/// Headroom reserved below the MTU for every outbound datagram.
pub const DATAGRAM_OVERHEAD: u16 = 60;
pub const MIN_MTU: u16 = 400;
pub const MAX_MTU: u16 = 1492;

pub const U24_MASK: u32 = 0x00ff_ffff;

/// Returns true for the flag byte of a data datagram (0x80..=0x8f).
pub fn is_datagram(id: u8) -> bool {
    id & 0xf0 == 0x80
}

pub fn clamp_mtu(mtu: u16) -> u16 {
    mtu.clamp(MIN_MTU, MAX_MTU)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_ids() {
        assert!(is_datagram(ID_DATA_4));
        assert!(is_datagram(ID_DATA_C));
        assert!(is_datagram(0x80));
        assert!(!is_datagram(ID_ACK));
        assert!(!is_datagram(ID_NAK));
        assert!(!is_datagram(ID_CONNECTED_PING));
        assert!(!is_datagram(0x92));
    }

    #[test]
    fn test_clamp_mtu() {
        assert_eq!(clamp_mtu(100), MIN_MTU);
        assert_eq!(clamp_mtu(1400), 1400);
        assert_eq!(clamp_mtu(9000), MAX_MTU);
    }
}
