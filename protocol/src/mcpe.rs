//! The handful of MCPE application packets the proxy has to look inside.
//!
//! Everything else travels through the proxy as opaque bytes.

use crate::codec::{BufExt, BufMutExt};
use crate::raknet::Packet;
use crate::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use uuid::Uuid;

pub const ID_LOGIN: u8 = 0x8f;
pub const ID_PLAYER_STATUS: u8 = 0x90;
pub const ID_DISCONNECT: u8 = 0x91;
pub const ID_BATCH: u8 = 0x92;
pub const ID_TEXT: u8 = 0x93;
pub const ID_START_GAME: u8 = 0x95;
pub const ID_MOVE_PLAYER: u8 = 0x9d;
pub const ID_ENTITY_EVENT: u8 = 0xa4;
pub const ID_ANIMATE: u8 = 0xb2;
pub const ID_RESPAWN: u8 = 0xb3;

/// Upper bound on the decompressed size of one batch.
pub const MAX_BATCH_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerLocation {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl PlayerLocation {
    fn write(&self, dst: &mut impl BufMut) {
        dst.put_f32(self.x);
        dst.put_f32(self.y);
        dst.put_f32(self.z);
    }

    fn read(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            x: src.read_f32()?,
            y: src.read_f32()?,
            z: src.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockCoordinates {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockCoordinates {
    fn write(&self, dst: &mut impl BufMut) {
        dst.put_i32(self.x);
        dst.put_i32(self.y);
        dst.put_i32(self.z);
    }

    fn read(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            x: src.read_i32()?,
            y: src.read_i32()?,
            z: src.read_i32()?,
        })
    }
}

/// A zlib-compressed bundle of length-prefixed packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    pub packets: Vec<Bytes>,
}

impl Batch {
    pub fn new(packets: Vec<Bytes>) -> Self {
        Self { packets }
    }

    pub fn encode(&self) -> io::Result<Bytes> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        for packet in &self.packets {
            encoder.write_all(&(packet.len() as i32).to_be_bytes())?;
            encoder.write_all(packet)?;
        }
        let compressed = encoder.finish()?;

        let mut buf = BytesMut::with_capacity(5 + compressed.len());
        buf.put_u8(ID_BATCH);
        buf.put_i32(compressed.len() as i32);
        buf.put_slice(&compressed);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut src = data;
        let found = src.read_u8()?;
        if found != ID_BATCH {
            return Err(DecodeError::UnexpectedId {
                expected: ID_BATCH,
                found,
            });
        }
        let declared = src.read_i32()?;
        if declared < 0 {
            return Err(DecodeError::InvalidLength(i64::from(declared)));
        }
        let compressed = src.read_slice((declared as usize).min(src.remaining()))?;

        let mut raw = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .take(MAX_BATCH_SIZE as u64 + 1)
            .read_to_end(&mut raw)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        if raw.len() > MAX_BATCH_SIZE {
            return Err(DecodeError::BatchTooLarge {
                limit: MAX_BATCH_SIZE,
            });
        }

        let mut raw = Bytes::from(raw);
        let mut packets = Vec::new();
        while raw.has_remaining() {
            let len = raw.read_i32()?;
            if len < 0 {
                return Err(DecodeError::InvalidLength(i64::from(len)));
            }
            packets.push(raw.read_slice(len as usize)?);
        }
        Ok(Self { packets })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Skin {
    pub alpha: u8,
    pub slim: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub protocol: i32,
    pub protocol_secondary: i32,
    pub client_guid: i64,
    pub client_uuid: Uuid,
    pub server_address: String,
    pub client_secret: String,
    pub skin: Skin,
}

impl Packet for Login {
    const ID: u8 = ID_LOGIN;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_string(&self.username);
        dst.put_i32(self.protocol);
        dst.put_i32(self.protocol_secondary);
        dst.put_i64(self.client_guid);
        dst.put_slice(self.client_uuid.as_bytes());
        dst.write_string(&self.server_address);
        dst.write_string(&self.client_secret);
        dst.put_u8(self.skin.alpha);
        dst.write_bool(self.skin.slim);
        dst.put_i16(self.skin.data.len() as i16);
        dst.put_slice(&self.skin.data);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let username = src.read_string()?;
        let protocol = src.read_i32()?;
        let protocol_secondary = src.read_i32()?;
        let client_guid = src.read_i64()?;
        let uuid = src.read_slice(16)?;
        let client_uuid = Uuid::from_slice(&uuid).map_err(|_| DecodeError::InvalidLength(16))?;
        let server_address = src.read_string()?;
        let client_secret = src.read_string()?;
        let alpha = src.read_u8()?;
        let slim = src.read_bool()?;
        let skin_len = src.read_i16()?;
        if skin_len < 0 {
            return Err(DecodeError::InvalidLength(i64::from(skin_len)));
        }
        let data = src.read_slice(skin_len as usize)?;
        Ok(Self {
            username,
            protocol,
            protocol_secondary,
            client_guid,
            client_uuid,
            server_address,
            client_secret,
            skin: Skin { alpha, slim, data },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StartGame {
    pub seed: i32,
    pub dimension: u8,
    pub generator: i32,
    pub gamemode: i32,
    pub entity_id: i64,
    pub spawn: BlockCoordinates,
    pub location: PlayerLocation,
    pub unknown: u8,
}

impl Packet for StartGame {
    const ID: u8 = ID_START_GAME;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i32(self.seed);
        dst.put_u8(self.dimension);
        dst.put_i32(self.generator);
        dst.put_i32(self.gamemode);
        dst.put_i64(self.entity_id);
        self.spawn.write(dst);
        self.location.write(dst);
        dst.put_u8(self.unknown);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            seed: src.read_i32()?,
            dimension: src.read_u8()?,
            generator: src.read_i32()?,
            gamemode: src.read_i32()?,
            entity_id: src.read_i64()?,
            spawn: BlockCoordinates::read(src)?,
            location: PlayerLocation::read(src)?,
            unknown: src.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub message: String,
}

impl Packet for Disconnect {
    const ID: u8 = ID_DISCONNECT;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.write_string(&self.message);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            message: src.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TextKind {
    Raw = 0,
    Chat = 1,
    Translation = 2,
    Popup = 3,
    Tip = 4,
}

impl TextKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TextKind::Chat,
            2 => TextKind::Translation,
            3 => TextKind::Popup,
            4 => TextKind::Tip,
            _ => TextKind::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub kind: TextKind,
    pub sender: String,
    pub message: String,
}

impl Text {
    pub fn raw(message: impl Into<String>) -> Self {
        Self {
            kind: TextKind::Raw,
            sender: String::new(),
            message: message.into(),
        }
    }
}

impl Packet for Text {
    const ID: u8 = ID_TEXT;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind as u8);
        if self.kind == TextKind::Chat {
            dst.write_string(&self.sender);
        }
        dst.write_string(&self.message);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        let kind = TextKind::from_u8(src.read_u8()?);
        let sender = if kind == TextKind::Chat {
            src.read_string()?
        } else {
            String::new()
        };
        Ok(Self {
            kind,
            sender,
            message: src.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Respawn {
    pub location: PlayerLocation,
}

impl Packet for Respawn {
    const ID: u8 = ID_RESPAWN;

    fn encode_body(&self, dst: &mut impl BufMut) {
        self.location.write(dst);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            location: PlayerLocation::read(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerStatus {
    pub status: i32,
}

impl Packet for PlayerStatus {
    const ID: u8 = ID_PLAYER_STATUS;

    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_i32(self.status);
    }

    fn decode_body(src: &mut impl Buf) -> Result<Self, DecodeError> {
        Ok(Self {
            status: src.read_i32()?,
        })
    }
}

/// Finds the first packet with id `id`, either the payload itself or inside a batch.
pub fn find_packet(payload: &[u8], id: u8) -> Option<Bytes> {
    let first = *payload.first()?;
    if first == id {
        return Some(Bytes::copy_from_slice(payload));
    }
    if first != ID_BATCH {
        return None;
    }
    Batch::decode(payload)
        .ok()?
        .packets
        .into_iter()
        .find(|p| p.first() == Some(&id))
}

pub fn find_start_game(payload: &[u8]) -> Option<StartGame> {
    StartGame::decode(&find_packet(payload, ID_START_GAME)?).ok()
}
