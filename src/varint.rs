use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// A QUIC variable-length integer: the top two bits of the first byte select
/// an encoded size of 1, 2, 4, or 8 bytes; the remaining bits hold the value
/// big-endian. Values above 2^62-1 are not representable.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unexpected end of input")]
pub struct VarIntUnexpectedEnd;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("value out of range for varint encoding")]
pub struct VarIntBoundsExceeded;

impl VarInt {
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    pub const fn from_u32(value: u32) -> Self {
        VarInt(value as u64)
    }

    pub fn from_u64(value: u64) -> Result<Self, VarIntBoundsExceeded> {
        if value > Self::MAX.0 {
            return Err(VarIntBoundsExceeded);
        }
        Ok(VarInt(value))
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The number of bytes this value occupies on the wire.
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < (1 << 6) {
            1
        } else if x < (1 << 14) {
            2
        } else if x < (1 << 30) {
            4
        } else {
            8
        }
    }

    /// The encoded size implied by the first byte of an encoding.
    pub const fn size_from_first(first: u8) -> usize {
        1 << (first >> 6)
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(VarIntUnexpectedEnd);
        }

        let mut bytes = [0u8; 8];
        bytes[0] = buf.get_u8();

        let size = Self::size_from_first(bytes[0]);
        if buf.remaining() < size - 1 {
            return Err(VarIntUnexpectedEnd);
        }
        buf.copy_to_slice(&mut bytes[1..size]);

        bytes[0] &= 0x3f;
        let mut value = 0u64;
        for b in &bytes[..size] {
            value = (value << 8) | u64::from(*b);
        }

        Ok(VarInt(value))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < (1 << 6) {
            buf.put_u8(x as u8);
        } else if x < (1 << 14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < (1 << 30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else {
            // from_u64 rejects anything the 8-byte form can't carry
            buf.put_u64(0b11 << 62 | x);
        }
    }
}

impl From<u32> for VarInt {
    fn from(value: u32) -> Self {
        VarInt(value as u64)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_u64(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::from_u64(value as u64)
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> u64 {
        v.0
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
