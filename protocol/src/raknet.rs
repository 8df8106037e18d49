//! RakNet offline and connection-handshake messages.

use crate::codec::{BufExt, BufMutExt};
use crate::{
    DecodeError, ID_CONNECTED_PING, ID_CONNECTED_PONG, ID_CONNECTION_REQUEST,
    ID_CONNECTION_REQUEST_ACCEPTED, ID_DISCONNECT_NOTIFICATION, ID_NEW_INCOMING_CONNECTION,
    ID_OPEN_CONNECTION_REPLY_1, ID_OPEN_CONNECTION_REPLY_2, ID_OPEN_CONNECTION_REQUEST_1,
    ID_OPEN_CONNECTION_REQUEST_2, ID_UNCONNECTED_PING, ID_UNCONNECTED_PING_OPEN_CONNECTIONS,
    ID_UNCONNECTED_PONG, MAGIC, UDP_HEADER_OVERHEAD,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr};

/// A message identified by its leading id byte.
pub trait Packet: Sized {
    const ID: u8;

    fn encode_body(&self, dst: &mut impl BufMut);
    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(Self::ID);
        self.encode_body(&mut buf);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut src = data;
        let found = src.read_u8()?;
        if found != Self::ID {
            return Err(DecodeError::UnexpectedId {
                expected: Self::ID,
                found,
            });
        }
        Self::decode_body(&mut src)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPing {
    pub timestamp: i64,
}

impl Packet for ConnectedPing {
    const ID: u8 = ID_CONNECTED_PING;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.timestamp);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            timestamp: src.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPong {
    pub ping_timestamp: i64,
    pub pong_timestamp: i64,
}

impl Packet for ConnectedPong {
    const ID: u8 = ID_CONNECTED_PONG;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.ping_timestamp);
        dst.put_i64(self.pong_timestamp);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            ping_timestamp: src.read_i64()?,
            pong_timestamp: src.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub ping_id: i64,
}

impl UnconnectedPing {
    /// Accepts both the plain ping id and the open-connections variant.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut src = data;
        match src.read_u8()? {
            ID_UNCONNECTED_PING | ID_UNCONNECTED_PING_OPEN_CONNECTIONS => Self::decode_body(&mut src),
            found => Err(DecodeError::UnexpectedId {
                expected: ID_UNCONNECTED_PING,
                found,
            }),
        }
    }
}

impl Packet for UnconnectedPing {
    const ID: u8 = ID_UNCONNECTED_PING;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.ping_id);
        dst.write_magic();
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let ping_id = src.read_i64()?;
        src.read_magic()?;
        Ok(Self { ping_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub ping_id: i64,
    pub server_guid: i64,
    pub name: String,
}

impl Packet for UnconnectedPong {
    const ID: u8 = ID_UNCONNECTED_PONG;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.ping_id);
        dst.put_i64(self.server_guid);
        dst.write_magic();
        dst.write_string(&self.name);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let ping_id = src.read_i64()?;
        let server_guid = src.read_i64()?;
        src.read_magic()?;
        Ok(Self {
            ping_id,
            server_guid,
            name: src.read_string()?,
        })
    }
}

/// First handshake request, zero-padded so its size advertises the path MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol: u8,
    pub mtu: u16,
}

impl Packet for OpenConnectionRequest1 {
    const ID: u8 = ID_OPEN_CONNECTION_REQUEST_1;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_magic();
        dst.put_u8(self.protocol);
        let written = 1 + MAGIC.len() + 1;
        let size = self.mtu.saturating_sub(UDP_HEADER_OVERHEAD) as usize;
        dst.put_bytes(0, size.saturating_sub(written));
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let size = 1 + src.remaining();
        src.read_magic()?;
        let protocol = src.read_u8()?;
        src.advance(src.remaining());
        let mtu = (size + UDP_HEADER_OVERHEAD as usize).min(u16::MAX as usize) as u16;
        Ok(Self { protocol, mtu })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: i64,
    pub secure: bool,
    pub mtu: u16,
}

impl Packet for OpenConnectionReply1 {
    const ID: u8 = ID_OPEN_CONNECTION_REPLY_1;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_magic();
        dst.put_i64(self.server_guid);
        dst.write_bool(self.secure);
        dst.put_u16(self.mtu);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        src.read_magic()?;
        Ok(Self {
            server_guid: src.read_i64()?,
            secure: src.read_bool()?,
            mtu: src.read_u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: i64,
}

impl Packet for OpenConnectionRequest2 {
    const ID: u8 = ID_OPEN_CONNECTION_REQUEST_2;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_magic();
        dst.write_address(&self.server_address);
        dst.put_u16(self.mtu);
        dst.put_i64(self.client_guid);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        src.read_magic()?;
        Ok(Self {
            server_address: src.read_address()?,
            mtu: src.read_u16()?,
            client_guid: src.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: i64,
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl Packet for OpenConnectionReply2 {
    const ID: u8 = ID_OPEN_CONNECTION_REPLY_2;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_magic();
        dst.put_i64(self.server_guid);
        dst.write_address(&self.client_address);
        dst.put_u16(self.mtu);
        // encryption disabled
        dst.put_u8(0);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        src.read_magic()?;
        let reply = Self {
            server_guid: src.read_i64()?,
            client_address: src.read_address()?,
            mtu: src.read_u16()?,
        };
        src.advance(src.remaining());
        Ok(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: i64,
    pub timestamp: i64,
    pub secure: bool,
}

impl Packet for ConnectionRequest {
    const ID: u8 = ID_CONNECTION_REQUEST;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i64(self.client_guid);
        dst.put_i64(self.timestamp);
        dst.write_bool(self.secure);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            client_guid: src.read_i64()?,
            timestamp: src.read_i64()?,
            secure: src.read_bool()?,
        })
    }
}

const INTERNAL_ADDRESS_COUNT: usize = 10;
const INTERNAL_ADDRESS_PORT: u16 = 19132;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

impl Packet for ConnectionRequestAccepted {
    const ID: u8 = ID_CONNECTION_REQUEST_ACCEPTED;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_address(&self.client_address);
        let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, INTERNAL_ADDRESS_PORT));
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, INTERNAL_ADDRESS_PORT));
        dst.write_address(&loopback);
        for _ in 1..INTERNAL_ADDRESS_COUNT {
            dst.write_address(&unspecified);
        }
        dst.put_i64(self.request_timestamp);
        dst.put_i64(self.accepted_timestamp);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let client_address = src.read_address()?;
        for _ in 0..INTERNAL_ADDRESS_COUNT {
            src.read_address()?;
        }
        Ok(Self {
            client_address,
            request_timestamp: src.read_i64()?,
            accepted_timestamp: src.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub cookie: i32,
    pub secure: bool,
    pub port: u16,
    pub session: [i64; 2],
}

impl Packet for NewIncomingConnection {
    const ID: u8 = ID_NEW_INCOMING_CONNECTION;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i32(self.cookie);
        dst.write_bool(self.secure);
        dst.put_u16(self.port);
        dst.put_i64(self.session[0]);
        dst.put_i64(self.session[1]);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            cookie: src.read_i32()?,
            secure: src.read_bool()?,
            port: src.read_u16()?,
            session: [src.read_i64()?, src.read_i64()?],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisconnectNotification;

impl Packet for DisconnectNotification {
    const ID: u8 = ID_DISCONNECT_NOTIFICATION;

    fn encode_body(&self, _dst: &mut impl BufMut) {}

    fn decode_body(_src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}
