use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::{ByteChain, Frame, FrameType, Http3Error, StreamRole, VarInt};

/// A consumer of inbound frames, selected by frame type.
pub trait FrameHandler: Send {
    fn interests(&self) -> Vec<FrameType>;

    /// `frame_seq` is the index of this frame within its stream. Incremental
    /// DATA chunks share the sequence number of the frame they belong to.
    fn handle_frame(
        &mut self,
        frame: &Frame,
        frame_seq: u64,
        role: StreamRole,
    ) -> Result<(), Http3Error>;
}

pub type SharedHandler = Arc<Mutex<dyn FrameHandler>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadingState {
    TypeLen,
    LengthLen,
    PayloadLen,
    Payload,
}

/// Reads as many whole frames as are available from a stream reader and
/// routes each to the handlers registered for its type.
///
/// The parser is incremental: state survives across calls, so the stream can
/// arrive one byte at a time. DATA payloads are delivered in chunks as they
/// arrive instead of being buffered, since they can be arbitrarily large.
pub struct FrameDispatcher {
    state: ReadingState,
    frame_type_id: u64,
    frame_length_len: usize,
    frame_payload_len: u64,
    payload_remaining: u64,
    frame_seq: u64,
    max_settings: u32,
    handlers: Vec<SharedHandler>,
    registry: [Vec<usize>; FrameType::COUNT],
}

impl FrameDispatcher {
    pub fn new(max_settings: u32) -> Self {
        Self {
            state: ReadingState::TypeLen,
            frame_type_id: 0,
            frame_length_len: 0,
            frame_payload_len: 0,
            payload_remaining: 0,
            frame_seq: 0,
            max_settings,
            handlers: Vec::new(),
            registry: Default::default(),
        }
    }

    pub fn add_handler(&mut self, handler: SharedHandler) {
        let interests = handler.lock().unwrap().interests();
        let index = self.handlers.len();
        self.handlers.push(handler);
        for typ in interests {
            self.registry[typ.index()].push(index);
        }
    }

    /// Advances the parser, consuming bytes from `reader`. `nread` is set to
    /// the number of bytes consumed by this call. The first handler error
    /// short-circuits the remaining handlers and is returned.
    pub fn on_read_ready(
        &mut self,
        stream_id: u64,
        role: StreamRole,
        reader: &mut ByteChain,
        nread: &mut u64,
    ) -> Result<(), Http3Error> {
        *nread = 0;

        loop {
            match self.state {
                ReadingState::TypeLen => {
                    let mut first = [0u8; 1];
                    if reader.peek(&mut first) == 0 {
                        break;
                    }
                    let type_len = VarInt::size_from_first(first[0]);
                    if reader.len() < type_len {
                        break;
                    }
                    let typ = VarInt::decode(reader).expect("length was checked");
                    *nread += type_len as u64;
                    self.frame_type_id = typ.into_inner();
                    self.state = ReadingState::LengthLen;
                }

                ReadingState::LengthLen => {
                    let mut first = [0u8; 1];
                    if reader.peek(&mut first) == 0 {
                        break;
                    }
                    self.frame_length_len = VarInt::size_from_first(first[0]);
                    self.state = ReadingState::PayloadLen;
                }

                ReadingState::PayloadLen => {
                    if reader.len() < self.frame_length_len {
                        break;
                    }
                    let len = VarInt::decode(reader).expect("length was checked");
                    *nread += self.frame_length_len as u64;
                    self.frame_payload_len = len.into_inner();
                    self.payload_remaining = self.frame_payload_len;
                    self.state = ReadingState::Payload;
                }

                ReadingState::Payload => {
                    if FrameType::from_id(self.frame_type_id) == FrameType::Data {
                        // Deliver whatever payload is buffered; don't wait
                        // for the whole frame.
                        let chunk = (self.payload_remaining).min(reader.len() as u64);
                        if chunk == 0 && self.payload_remaining > 0 {
                            break;
                        }
                        let payload = reader.take(chunk as usize).to_bytes();
                        *nread += chunk;
                        self.payload_remaining -= chunk;

                        let seq = self.frame_seq;
                        let last = self.payload_remaining == 0;
                        if last {
                            self.finish_frame();
                        }
                        let frame = Frame::from_payload(0x00, payload, self.max_settings);
                        self.dispatch(stream_id, &frame, seq, role)?;
                        if !last {
                            // More payload to come; wait for it.
                            break;
                        }
                    } else {
                        if (reader.len() as u64) < self.payload_remaining {
                            break;
                        }
                        let payload = reader.take(self.frame_payload_len as usize).to_bytes();
                        *nread += self.frame_payload_len;

                        let seq = self.frame_seq;
                        self.finish_frame();
                        let frame =
                            Frame::from_payload(self.frame_type_id, payload, self.max_settings);
                        self.dispatch(stream_id, &frame, seq, role)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn finish_frame(&mut self) {
        self.frame_seq += 1;
        self.state = ReadingState::TypeLen;
    }

    fn dispatch(
        &mut self,
        stream_id: u64,
        frame: &Frame,
        frame_seq: u64,
        role: StreamRole,
    ) -> Result<(), Http3Error> {
        let typ = frame.frame_type();
        trace!(
            target: "h3",
            "[RX] [{}] {:?} seq={} len={}",
            stream_id,
            typ,
            frame_seq,
            frame.length()
        );

        for &index in &self.registry[typ.index()] {
            if let Err(err) = self.handlers[index]
                .lock()
                .unwrap()
                .handle_frame(frame, frame_seq, role)
            {
                debug!(target: "h3", "[{}] handler error: {}", stream_id, err);
                return Err(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Records every frame it sees.
    struct MockHandler {
        received: Vec<(FrameType, u64, Bytes)>,
    }

    impl MockHandler {
        fn new() -> Arc<Mutex<Self>> {
            Arc::new(Mutex::new(Self { received: Vec::new() }))
        }
    }

    impl FrameHandler for MockHandler {
        fn interests(&self) -> Vec<FrameType> {
            FrameType::ALL.to_vec()
        }

        fn handle_frame(
            &mut self,
            frame: &Frame,
            frame_seq: u64,
            _role: StreamRole,
        ) -> Result<(), Http3Error> {
            let payload = match frame {
                Frame::Data(f) => f.payload().clone(),
                Frame::Headers(f) => f.header_block().clone(),
                Frame::Unknown(f) => f.payload().clone(),
                Frame::Settings(_) => Bytes::new(),
            };
            self.received.push((frame.frame_type(), frame_seq, payload));
            Ok(())
        }
    }

    fn feed_all(dispatcher: &mut FrameDispatcher, input: &[u8]) -> u64 {
        let mut reader = ByteChain::new();
        reader.write(input);
        let mut nread = 0;
        dispatcher
            .on_read_ready(0, StreamRole::Request, &mut reader, &mut nread)
            .unwrap();
        nread
    }

    fn feed_byte_at_a_time(dispatcher: &mut FrameDispatcher, input: &[u8]) -> u64 {
        let mut reader = ByteChain::new();
        let mut total = 0;
        for &b in input {
            reader.write(&[b]);
            let mut nread = 0;
            dispatcher
                .on_read_ready(0, StreamRole::Request, &mut reader, &mut nread)
                .unwrap();
            total += nread;
        }
        total
    }

    #[test]
    fn whole_frames() {
        let mut dispatcher = FrameDispatcher::new(10);
        let handler = MockHandler::new();
        dispatcher.add_handler(handler.clone());

        let input = [
            0x01, 0x02, 0x11, 0x22, // HEADERS
            0x00, 0x04, 0x11, 0x22, 0x33, 0x44, // DATA
            0xff, // dangling byte
        ];
        let nread = feed_all(&mut dispatcher, &input);
        assert_eq!(nread, 10);

        let received = &handler.lock().unwrap().received;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, FrameType::Headers);
        assert_eq!(received[0].1, 0);
        assert_eq!(received[1].0, FrameType::Data);
        assert_eq!(received[1].1, 1);
        assert_eq!(received[1].2.as_ref(), &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn multibyte_type_streamed_byte_at_a_time() {
        let mut dispatcher = FrameDispatcher::new(10);
        let handler = MockHandler::new();
        dispatcher.add_handler(handler.clone());

        let input = [
            // HEADERS with an 8-byte type encoding
            0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x11, 0x22, 0x33, 0x44,
            // DATA, delivered incrementally
            0x00, 0x04, 0xaa, 0xbb, 0xcc, 0xdd,
            // dangling byte
            0xff,
        ];
        let nread = feed_byte_at_a_time(&mut dispatcher, &input);
        assert_eq!(nread, 19);

        let received = &handler.lock().unwrap().received;
        assert_eq!(received.len(), 5);
        assert_eq!(received[0].0, FrameType::Headers);
        assert_eq!(received[0].2.as_ref(), &[0x11, 0x22, 0x33, 0x44]);
        // Four one-byte DATA chunks, all with the same frame sequence.
        for (i, byte) in [0xaau8, 0xbb, 0xcc, 0xdd].iter().enumerate() {
            assert_eq!(received[1 + i].0, FrameType::Data);
            assert_eq!(received[1 + i].1, 1);
            assert_eq!(received[1 + i].2.as_ref(), &[*byte]);
        }
    }

    #[test]
    fn incrementality_matches_whole_feed() {
        // The same handler observations, whether fed whole or byte-at-a-time,
        // for frame types that are buffered to completion.
        let input = [
            0x01, 0x03, 0xaa, 0xbb, 0xcc, // HEADERS
            0x04, 0x02, 0x01, 0x00, // SETTINGS
        ];

        let mut whole = FrameDispatcher::new(10);
        let whole_handler = MockHandler::new();
        whole.add_handler(whole_handler.clone());
        assert_eq!(feed_all(&mut whole, &input), 9);

        let mut incremental = FrameDispatcher::new(10);
        let incremental_handler = MockHandler::new();
        incremental.add_handler(incremental_handler.clone());
        assert_eq!(feed_byte_at_a_time(&mut incremental, &input), 9);

        assert_eq!(
            whole_handler.lock().unwrap().received,
            incremental_handler.lock().unwrap().received
        );
    }

    #[test]
    fn type_encoded_non_minimally() {
        // SETTINGS with its type in a 2-byte varint.
        let mut dispatcher = FrameDispatcher::new(10);
        let handler = MockHandler::new();
        dispatcher.add_handler(handler.clone());

        let input = [0x40, 0x04, 0x03, 0x06, 0x44, 0x00];
        let nread = feed_all(&mut dispatcher, &input);
        assert_eq!(nread, 6);

        let received = &handler.lock().unwrap().received;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, FrameType::Settings);
    }

    #[test]
    fn zero_length_data_frame() {
        let mut dispatcher = FrameDispatcher::new(10);
        let handler = MockHandler::new();
        dispatcher.add_handler(handler.clone());

        let nread = feed_all(&mut dispatcher, &[0x00, 0x00]);
        assert_eq!(nread, 2);
        let received = &handler.lock().unwrap().received;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].2.len(), 0);
    }

    #[test]
    fn handler_error_short_circuits() {
        struct Failing;
        impl FrameHandler for Failing {
            fn interests(&self) -> Vec<FrameType> {
                FrameType::ALL.to_vec()
            }
            fn handle_frame(
                &mut self,
                _frame: &Frame,
                _seq: u64,
                _role: StreamRole,
            ) -> Result<(), Http3Error> {
                Err(Http3Error::stream(
                    crate::ErrorCode::H3FrameUnexpected,
                    "nope",
                ))
            }
        }

        let mut dispatcher = FrameDispatcher::new(10);
        dispatcher.add_handler(Arc::new(Mutex::new(Failing)));
        let late = MockHandler::new();
        dispatcher.add_handler(late.clone());

        let mut reader = ByteChain::new();
        reader.write(&[0x01, 0x01, 0x00, 0x01, 0x01, 0x00]);
        let mut nread = 0;
        let err = dispatcher
            .on_read_ready(0, StreamRole::Request, &mut reader, &mut nread)
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::H3FrameUnexpected);
        // The first frame was consumed before the error surfaced.
        assert_eq!(nread, 3);
        assert!(late.lock().unwrap().received.is_empty());
    }
}
