use bytes::{Buf, BufMut, Bytes};

use crate::{ByteChain, SettingsFrame, VarInt, VarIntUnexpectedEnd};

/// HTTP/3 frame types. Reserved identifiers are kept distinct so handlers can
/// reject them; anything above `MAX_DEFINED` collapses to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Reserved1,
    CancelPush,
    Settings,
    PushPromise,
    Reserved2,
    Goaway,
    Reserved3,
    Reserved4,
    MaxPushId,
    Unknown,
}

impl FrameType {
    pub const MAX_DEFINED: u64 = 0x0d;

    /// Every type, for handlers interested in all frames.
    pub const ALL: [FrameType; 12] = [
        FrameType::Data,
        FrameType::Headers,
        FrameType::Reserved1,
        FrameType::CancelPush,
        FrameType::Settings,
        FrameType::PushPromise,
        FrameType::Reserved2,
        FrameType::Goaway,
        FrameType::Reserved3,
        FrameType::Reserved4,
        FrameType::MaxPushId,
        FrameType::Unknown,
    ];

    pub fn from_id(id: u64) -> FrameType {
        match id {
            0x00 => FrameType::Data,
            0x01 => FrameType::Headers,
            0x02 => FrameType::Reserved1,
            0x03 => FrameType::CancelPush,
            0x04 => FrameType::Settings,
            0x05 => FrameType::PushPromise,
            0x06 => FrameType::Reserved2,
            0x07 => FrameType::Goaway,
            0x08 => FrameType::Reserved3,
            0x09 => FrameType::Reserved4,
            0x0d => FrameType::MaxPushId,
            _ => FrameType::Unknown,
        }
    }

    /// Dense index for per-type tables (handler registry, counters).
    pub fn index(self) -> usize {
        match self {
            FrameType::Data => 0,
            FrameType::Headers => 1,
            FrameType::Reserved1 => 2,
            FrameType::CancelPush => 3,
            FrameType::Settings => 4,
            FrameType::PushPromise => 5,
            FrameType::Reserved2 => 6,
            FrameType::Goaway => 7,
            FrameType::Reserved3 => 8,
            FrameType::Reserved4 => 9,
            FrameType::MaxPushId => 10,
            FrameType::Unknown => 11,
        }
    }

    pub const COUNT: usize = 12;

    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            FrameType::Reserved1 | FrameType::Reserved2 | FrameType::Reserved3 | FrameType::Reserved4
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    payload: Bytes,
}

impl DataFrame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    header_block: Bytes,
}

impl HeadersFrame {
    pub fn new(header_block: Bytes) -> Self {
        Self { header_block }
    }

    pub fn header_block(&self) -> &Bytes {
        &self.header_block
    }
}

/// Any frame we don't interpret. The original bytes are retained for
/// pass-through or metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    id: u64,
    payload: Bytes,
}

impl UnknownFrame {
    pub fn new(id: u64, payload: Bytes) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Settings(SettingsFrame),
    Unknown(UnknownFrame),
}

impl Frame {
    /// Decodes the type of the frame starting at `buf`. Requires at least the
    /// whole type varint.
    pub fn peek_type(mut buf: &[u8]) -> Result<FrameType, VarIntUnexpectedEnd> {
        let id = VarInt::decode(&mut buf)?;
        Ok(FrameType::from_id(id.into_inner()))
    }

    /// Decodes the declared payload length of the frame starting at `buf`.
    pub fn peek_length(mut buf: &[u8]) -> Result<u64, VarIntUnexpectedEnd> {
        VarInt::decode(&mut buf)?;
        Ok(VarInt::decode(&mut buf)?.into_inner())
    }

    /// Builds a typed frame from a raw type id and its complete payload.
    /// `max_settings` caps the number of recognized SETTINGS pairs.
    pub fn from_payload(id: u64, payload: Bytes, max_settings: u32) -> Frame {
        match FrameType::from_id(id) {
            FrameType::Data => Frame::Data(DataFrame::new(payload)),
            FrameType::Headers => Frame::Headers(HeadersFrame::new(payload)),
            FrameType::Settings => Frame::Settings(SettingsFrame::parse(&payload, max_settings)),
            _ => Frame::Unknown(UnknownFrame::new(id, payload)),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Settings(_) => FrameType::Settings,
            Frame::Unknown(f) => FrameType::from_id(f.id),
        }
    }

    /// The type id that goes on the wire.
    pub fn type_id(&self) -> u64 {
        match self {
            Frame::Data(_) => 0x00,
            Frame::Headers(_) => 0x01,
            Frame::Settings(_) => 0x04,
            Frame::Unknown(f) => f.id,
        }
    }

    /// Declared payload length.
    pub fn length(&self) -> u64 {
        match self {
            Frame::Data(f) => f.payload.len() as u64,
            Frame::Headers(f) => f.header_block.len() as u64,
            Frame::Settings(f) => f.payload_len(),
            Frame::Unknown(f) => f.payload.len() as u64,
        }
    }

    /// Wire size: type varint + length varint + payload.
    pub fn total_length(&self) -> u64 {
        let typ = VarInt::from_u64(self.type_id()).expect("frame type fits a varint");
        let len = VarInt::from_u64(self.length()).expect("frame length fits a varint");
        typ.size() as u64 + len.size() as u64 + self.length()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let typ = VarInt::from_u64(self.type_id()).expect("frame type fits a varint");
        let len = VarInt::from_u64(self.length()).expect("frame length fits a varint");
        typ.encode(buf);
        len.encode(buf);
        match self {
            Frame::Data(f) => buf.put_slice(&f.payload),
            Frame::Headers(f) => buf.put_slice(&f.header_block),
            Frame::Settings(f) => f.encode_payload(buf),
            Frame::Unknown(f) => buf.put_slice(&f.payload),
        }
    }

    /// Serializes without copying the payload: the header goes into a fresh
    /// block, the payload blocks are shared.
    pub fn to_chain(&self) -> ByteChain {
        let mut chain = ByteChain::new();
        let mut header = Vec::with_capacity(16);
        let typ = VarInt::from_u64(self.type_id()).expect("frame type fits a varint");
        let len = VarInt::from_u64(self.length()).expect("frame length fits a varint");
        typ.encode(&mut header);
        len.encode(&mut header);
        chain.append(Bytes::from(header));
        match self {
            Frame::Data(f) => chain.append(f.payload.clone()),
            Frame::Headers(f) => chain.append(f.header_block.clone()),
            Frame::Settings(f) => {
                let mut payload = Vec::new();
                f.encode_payload(&mut payload);
                chain.append(Bytes::from(payload));
            }
            Frame::Unknown(f) => chain.append(f.payload.clone()),
        }
        chain
    }

    /// Reads one whole frame from `buf`, if it holds one.
    pub fn parse(buf: &mut ByteChain, max_settings: u32) -> Option<Frame> {
        let mut lookahead = buf.clone();
        let typ = VarInt::decode(&mut lookahead).ok()?;
        let len = VarInt::decode(&mut lookahead).ok()?;
        if (lookahead.remaining() as u64) < len.into_inner() {
            return None;
        }

        let header_len = buf.remaining() - lookahead.remaining();
        buf.consume(header_len);
        let payload = buf.take(len.into_inner() as usize).to_bytes();
        Some(Frame::from_payload(typ.into_inner(), payload, max_settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mapping() {
        assert_eq!(Frame::peek_type(&[0x00, 0x00]).unwrap(), FrameType::Data);
        // Undefined within the defined range
        assert_eq!(Frame::peek_type(&[0x0f, 0x00]).unwrap(), FrameType::Unknown);
        assert_eq!(
            Frame::peek_type(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]).unwrap(),
            FrameType::Unknown
        );
    }

    #[test]
    fn load_data_frame() {
        let mut buf = ByteChain::new();
        buf.write(&[0x00, 0x04, 0x11, 0x22, 0x33, 0x44]);

        let frame = Frame::parse(&mut buf, 10).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Data);
        assert_eq!(frame.length(), 4);
        assert_eq!(frame.total_length(), 6);

        match frame {
            Frame::Data(data) => assert_eq!(data.payload().as_ref(), &[0x11, 0x22, 0x33, 0x44]),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn store_data_frame() {
        let frame = Frame::Data(DataFrame::new(Bytes::from_static(&[0x11, 0x22, 0x33, 0x44])));
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf, [0x00, 0x04, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(frame.to_chain().to_bytes().as_ref(), buf.as_slice());
    }

    #[test]
    fn store_headers_frame() {
        let frame = Frame::Headers(HeadersFrame::new(Bytes::from_static(&[0x11, 0x22, 0x33, 0x44])));
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf, [0x01, 0x04, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn parse_incomplete() {
        let mut buf = ByteChain::new();
        buf.write(&[0x00, 0x04, 0x11]);
        assert_eq!(Frame::parse(&mut buf, 10), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn parse_unknown_retains_bytes() {
        let mut buf = ByteChain::new();
        buf.write(&[0x0f, 0x02, 0xaa, 0xbb]);
        let frame = Frame::parse(&mut buf, 10).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Unknown);
        match frame {
            Frame::Unknown(f) => {
                assert_eq!(f.id(), 0x0f);
                assert_eq!(f.payload().as_ref(), &[0xaa, 0xbb]);
            }
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[test]
    fn length_precision() {
        // total_length == size(type) + size(length) + length, with a payload
        // long enough to need a 2-byte length varint.
        let payload = Bytes::from(vec![0u8; 100]);
        let frame = Frame::Data(DataFrame::new(payload));
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len() as u64, frame.total_length());
        assert_eq!(frame.total_length(), 1 + 2 + 100);
    }
}
