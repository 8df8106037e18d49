//! Bounds-checked primitive readers and writers over `bytes` buffers.
//!
//! Multi-byte integers are big-endian except the 24-bit sequence fields,
//! which RakNet writes little-endian.

use crate::{DecodeError, MAGIC};
use bytes::{Buf, BufMut, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

const AF_INET6: u16 = 23;

fn ensure<B: Buf + ?Sized>(src: &B, needed: usize) -> Result<(), DecodeError> {
    if src.remaining() < needed {
        return Err(DecodeError::UnexpectedEof {
            needed: needed - src.remaining(),
        });
    }
    Ok(())
}

pub trait BufExt: Buf {
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        ensure(self, 1)?;
        Ok(self.get_u8())
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        ensure(self, 2)?;
        Ok(self.get_u16())
    }

    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        ensure(self, 2)?;
        Ok(self.get_i16())
    }

    fn read_u24_le(&mut self) -> Result<u32, DecodeError> {
        ensure(self, 3)?;
        Ok(self.get_uint_le(3) as u32)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        ensure(self, 4)?;
        Ok(self.get_u32())
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        ensure(self, 4)?;
        Ok(self.get_i32())
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        ensure(self, 8)?;
        Ok(self.get_i64())
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        ensure(self, 8)?;
        Ok(self.get_u64())
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        ensure(self, 4)?;
        Ok(self.get_f32())
    }

    fn read_slice(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        ensure(self, len)?;
        Ok(self.copy_to_bytes(len))
    }

    fn read_rest(&mut self) -> Bytes {
        let len = self.remaining();
        self.copy_to_bytes(len)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_slice(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString)
    }

    fn read_magic(&mut self) -> Result<(), DecodeError> {
        let raw = self.read_slice(MAGIC.len())?;
        if raw[..] != MAGIC {
            return Err(DecodeError::InvalidMagic);
        }
        Ok(())
    }

    fn read_address(&mut self) -> Result<SocketAddr, DecodeError> {
        match self.read_u8()? {
            4 => {
                let mut octets = [0u8; 4];
                ensure(self, 4)?;
                self.copy_to_slice(&mut octets);
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            6 => {
                ensure(self, 2 + 2 + 4 + 16 + 4)?;
                let _family = self.get_u16_le();
                let port = self.get_u16();
                let flowinfo = self.get_u32();
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let scope_id = self.get_u32();
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            other => Err(DecodeError::InvalidAddressVersion(other)),
        }
    }
}

impl<T: Buf + ?Sized> BufExt for T {}

pub trait BufMutExt: BufMut {
    fn write_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn write_u24_le(&mut self, value: u32) {
        self.put_uint_le(u64::from(value & crate::U24_MASK), 3);
    }

    fn write_string(&mut self, value: &str) {
        let raw = value.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&raw[..len]);
    }

    fn write_magic(&mut self) {
        self.put_slice(&MAGIC);
    }

    fn write_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(4);
                self.put_slice(&v4.ip().octets());
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(6);
                self.put_u16_le(AF_INET6);
                self.put_u16(v6.port());
                self.put_u32(v6.flowinfo());
                self.put_slice(&v6.ip().octets());
                self.put_u32(v6.scope_id());
            }
        }
    }
}

impl<T: BufMut + ?Sized> BufMutExt for T {}
