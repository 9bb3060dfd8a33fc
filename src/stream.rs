use bytes::{Buf, BufMut};

use crate::{VarInt, VarIntUnexpectedEnd};

/// Sent as the first byte of a unidirectional stream to identify its purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKind(pub VarInt);

impl StreamKind {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(StreamKind(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }
}

macro_rules! stream_kinds {
    {$($name:ident = $val:expr,)*} => {
        impl StreamKind {
            $(pub const $name: StreamKind = StreamKind(VarInt::from_u32($val));)*
        }
    }
}

stream_kinds! {
    CONTROL = 0x43,
    QPACK_ENCODER = 0x48,
    PUSH = 0x50,
    QPACK_DECODER = 0x68,
}

/// The protocol purpose of a QUIC stream, determined once: by first byte for
/// unidirectional streams, by direction for bidirectional ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Control,
    QpackEncoder,
    QpackDecoder,
    Push,
    Request,
    Unknown,
}

impl StreamRole {
    pub fn from_kind(kind: StreamKind) -> StreamRole {
        match kind {
            StreamKind::CONTROL => StreamRole::Control,
            StreamKind::QPACK_ENCODER => StreamRole::QpackEncoder,
            StreamKind::QPACK_DECODER => StreamRole::QpackDecoder,
            StreamKind::PUSH => StreamRole::Push,
            _ => StreamRole::Unknown,
        }
    }
}

/// The two low bits of a QUIC stream id encode initiator and directionality.
pub fn is_bidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 == 0
}

pub fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 0
}
