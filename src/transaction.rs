use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, trace};

use crate::{
    AdapterState, ByteChain, DataFrame, ErrorClass, EventKind, EventQueue, EventTarget,
    FieldSection, Frame, FrameCollector, FrameDispatcher, FrameGenerator, FrameHandler,
    FrameType, HeadersFrame, Http3Error, Metrics, ProtocolEnforcer, Qpack, QpackEvent,
    SharedVio, StreamRole, StreamVioAdapter, VioOp,
};

//
// Outbound: framers
//

/// Turns the HTTP/1.1 message head arriving on the transaction's write VIO
/// into a QPACK-encoded header block, emitted as one or more HEADERS frames.
pub struct HeaderFramer {
    qpack: Arc<Mutex<Qpack>>,
    stream_id: u64,
    source: SharedVio,
    header_block: Option<Bytes>,
    written: usize,
    sent_all: bool,
    header_sent: Arc<AtomicBool>,
}

impl HeaderFramer {
    pub fn new(
        qpack: Arc<Mutex<Qpack>>,
        stream_id: u64,
        source: SharedVio,
        header_sent: Arc<AtomicBool>,
    ) -> Self {
        Self {
            qpack,
            stream_id,
            source,
            header_block: None,
            written: 0,
            sent_all: false,
            header_sent,
        }
    }

    /// Parses the message head out of the source VIO once it has fully
    /// arrived, then compresses it.
    fn generate_header_block(&mut self) -> Result<(), Http3Error> {
        let section;
        {
            let mut vio = self.source.lock().unwrap();
            if vio.op != VioOp::Write {
                return Ok(());
            }
            let buffered = vio.buffer.to_bytes();
            match FieldSection::parse_http1(&buffered) {
                None => return Ok(()), // head not complete yet
                Some(Err(err)) => return Err(err),
                Some(Ok((parsed, consumed))) => {
                    vio.buffer.consume(consumed);
                    vio.ndone += consumed as i64;
                    section = parsed;
                }
            }
        }

        let mut block = Vec::new();
        self.qpack
            .lock()
            .unwrap()
            .encode(self.stream_id, &section, &mut block)?;
        self.header_block = Some(Bytes::from(block));
        Ok(())
    }
}

impl FrameGenerator for HeaderFramer {
    fn generate_frame(&mut self, max_size: usize) -> Result<Option<Frame>, Http3Error> {
        if self.sent_all {
            return Ok(None);
        }

        if self.header_block.is_none() {
            self.generate_header_block()?;
        }

        let Some(block) = &self.header_block else {
            return Ok(None);
        };

        let len = (block.len() - self.written).min(max_size);
        let chunk = block.slice(self.written..self.written + len);
        self.written += len;

        if self.written == block.len() {
            self.sent_all = true;
            self.header_sent.store(true, Ordering::Release);
        }

        Ok(Some(Frame::Headers(HeadersFrame::new(chunk))))
    }

    fn is_done(&self) -> bool {
        self.sent_all
    }
}

/// Slices the message body arriving on the write VIO into DATA frames.
/// Produces nothing until the header framer has emitted the whole HEADERS
/// frame, which keeps HEADERS ahead of DATA on the stream.
pub struct DataFramer {
    source: SharedVio,
    header_sent: Arc<AtomicBool>,
}

impl DataFramer {
    pub fn new(source: SharedVio, header_sent: Arc<AtomicBool>) -> Self {
        Self { source, header_sent }
    }
}

impl FrameGenerator for DataFramer {
    fn generate_frame(&mut self, max_size: usize) -> Result<Option<Frame>, Http3Error> {
        if !self.header_sent.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut vio = self.source.lock().unwrap();
        if vio.op != VioOp::Write {
            return Ok(None);
        }

        let len = vio.buffer.len().min(max_size);
        if len == 0 {
            return Ok(None);
        }

        let payload = vio.buffer.take(len).to_bytes();
        vio.ndone += len as i64;
        Ok(Some(Frame::Data(DataFrame::new(payload))))
    }

    fn is_done(&self) -> bool {
        let vio = self.source.lock().unwrap();
        self.header_sent.load(Ordering::Acquire) && vio.ntodo() == 0 && vio.buffer.is_empty()
    }
}

//
// Inbound: VIO adaptors
//

/// Receives HEADERS frames, hands the block to QPACK, and on decode
/// completion writes the HTTP/1.1 message head into the read VIO.
pub struct HeaderVioAdaptor {
    qpack: Arc<Mutex<Qpack>>,
    stream_id: u64,
    sink: SharedVio,
    is_complete: bool,
}

impl HeaderVioAdaptor {
    pub fn new(qpack: Arc<Mutex<Qpack>>, stream_id: u64, sink: SharedVio) -> Self {
        Self {
            qpack,
            stream_id,
            sink,
            is_complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Drops any in-flight decode and tells the peer's encoder the stream
    /// is gone, releasing its dynamic-table references.
    pub fn cancel(&mut self) {
        self.qpack.lock().unwrap().cancel(self.stream_id);
    }

    pub fn on_decode_complete(&mut self, section: &FieldSection) -> Result<(), Http3Error> {
        let head = section.to_http1()?;
        let mut vio = self.sink.lock().unwrap();
        vio.buffer.write(&head);
        vio.ndone += head.len() as i64;
        self.is_complete = true;
        Ok(())
    }
}

impl FrameHandler for HeaderVioAdaptor {
    fn interests(&self) -> Vec<FrameType> {
        vec![FrameType::Headers]
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        _frame_seq: u64,
        _role: StreamRole,
    ) -> Result<(), Http3Error> {
        let Frame::Headers(headers) = frame else {
            return Ok(());
        };

        match self
            .qpack
            .lock()
            .unwrap()
            .decode(self.stream_id, headers.header_block().clone())?
        {
            crate::DecodeStatus::Done => {}
            crate::DecodeStatus::Blocked => {
                debug!(target: "h3", "[{}] header decode blocked", self.stream_id);
            }
        }
        Ok(())
    }
}

/// Receives DATA frames and forwards the payload into the read VIO. Body
/// bytes are held back until the header section has been delivered, so the
/// message reaches the consumer in order even when QPACK decoding lags the
/// stream.
pub struct StreamDataVioAdaptor {
    sink: SharedVio,
    pending: Vec<Bytes>,
    finalized: bool,
    total_received: u64,
}

impl StreamDataVioAdaptor {
    pub fn new(sink: SharedVio) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            finalized: false,
            total_received: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.total_received > 0
    }

    /// Flushes held-back body bytes; called once the header section is in
    /// the read VIO.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let mut vio = self.sink.lock().unwrap();
        for chunk in self.pending.drain(..) {
            vio.ndone += chunk.len() as i64;
            vio.buffer.append(chunk);
        }
    }
}

impl FrameHandler for StreamDataVioAdaptor {
    fn interests(&self) -> Vec<FrameType> {
        vec![FrameType::Data]
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        _frame_seq: u64,
        _role: StreamRole,
    ) -> Result<(), Http3Error> {
        let Frame::Data(data) = frame else {
            return Ok(());
        };

        self.total_received += data.payload().len() as u64;
        if self.finalized {
            let mut vio = self.sink.lock().unwrap();
            vio.ndone += data.payload().len() as i64;
            vio.buffer.append(data.payload().clone());
        } else {
            self.pending.push(data.payload().clone());
        }
        Ok(())
    }
}

//
// Transaction
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Closed,
}

/// One HTTP exchange over one bidirectional QUIC stream.
///
/// Inbound, the per-stream dispatcher feeds a header adaptor and a data
/// adaptor which assemble the message into `read_vio` for the HTTP state
/// machine. Outbound, the collector drains a header framer and a data framer
/// which consume the serialized message from `write_vio`.
pub struct Transaction {
    stream_id: u64,
    state: TransactionState,
    events: EventQueue,

    adapter: StreamVioAdapter,

    read_vio: SharedVio,
    write_vio: SharedVio,

    dispatcher: FrameDispatcher,
    collector: FrameCollector,

    header_adaptor: Arc<Mutex<HeaderVioAdaptor>>,
    data_adaptor: Arc<Mutex<StreamDataVioAdaptor>>,
    header_framer: Arc<Mutex<HeaderFramer>>,
    data_framer: Arc<Mutex<DataFramer>>,

    send_complete: bool,
    fin_sent: bool,
    last_error: Option<Http3Error>,
}

impl Transaction {
    pub fn new(
        stream_id: u64,
        local_qpack: Arc<Mutex<Qpack>>,
        remote_qpack: Arc<Mutex<Qpack>>,
        metrics: Arc<Metrics>,
        max_settings: u32,
        events: EventQueue,
    ) -> Self {
        let mut adapter = StreamVioAdapter::new(stream_id, events.clone());
        adapter.do_io_read(EventTarget::Stream(stream_id), i64::MAX);
        adapter.do_io_write(EventTarget::Stream(stream_id), i64::MAX);

        let read_vio = crate::shared_vio();
        let write_vio = crate::shared_vio();

        let header_sent = Arc::new(AtomicBool::new(false));
        let header_framer = Arc::new(Mutex::new(HeaderFramer::new(
            local_qpack,
            stream_id,
            write_vio.clone(),
            header_sent.clone(),
        )));
        let data_framer = Arc::new(Mutex::new(DataFramer::new(write_vio.clone(), header_sent)));

        let mut collector = FrameCollector::new();
        collector.add_generator(header_framer.clone());
        collector.add_generator(data_framer.clone());

        let header_adaptor = Arc::new(Mutex::new(HeaderVioAdaptor::new(
            remote_qpack,
            stream_id,
            read_vio.clone(),
        )));
        let data_adaptor = Arc::new(Mutex::new(StreamDataVioAdaptor::new(read_vio.clone())));

        let mut dispatcher = FrameDispatcher::new(max_settings);
        dispatcher.add_handler(Arc::new(Mutex::new(ProtocolEnforcer::new())));
        dispatcher.add_handler(Arc::new(Mutex::new(crate::FrameCounter::new(metrics))));
        dispatcher.add_handler(header_adaptor.clone());
        dispatcher.add_handler(data_adaptor.clone());

        Self {
            stream_id,
            state: TransactionState::Open,
            events,
            adapter,
            read_vio,
            write_vio,
            dispatcher,
            collector,
            header_adaptor,
            data_adaptor,
            header_framer,
            data_framer,
            send_complete: false,
            fin_sent: false,
            last_error: None,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The inbound channel: assembled message bytes, for the HTTP state
    /// machine to consume.
    pub fn read_vio(&self) -> SharedVio {
        self.read_vio.clone()
    }

    /// The outbound channel: the HTTP state machine writes the serialized
    /// message here.
    pub fn write_vio(&self) -> SharedVio {
        self.write_vio.clone()
    }

    /// The HTTP state machine arms the inbound channel: assembled message
    /// bytes land in the returned VIO and `READ_READY`/`READ_COMPLETE`
    /// events go to `Application(stream_id)`.
    pub fn do_io_read(&mut self, nbytes: i64) -> SharedVio {
        self.read_vio.lock().unwrap().arm(
            VioOp::Read,
            Some(EventTarget::Application(self.stream_id)),
            nbytes,
        );
        // Frames may already be buffered; reprocess, and let the consumer
        // know the channel is live.
        self.events
            .schedule_immediate(EventTarget::Stream(self.stream_id), EventKind::ReadReady);
        self.events
            .schedule_immediate(EventTarget::Application(self.stream_id), EventKind::ReadReady);
        self.read_vio.clone()
    }

    /// The HTTP state machine arms the outbound channel and writes the
    /// serialized message into the returned VIO's buffer.
    pub fn do_io_write(&mut self, nbytes: i64) -> SharedVio {
        self.write_vio.lock().unwrap().arm(
            VioOp::Write,
            Some(EventTarget::Application(self.stream_id)),
            nbytes,
        );
        self.events
            .schedule_immediate(EventTarget::Stream(self.stream_id), EventKind::WriteReady);
        self.events
            .schedule_immediate(EventTarget::Application(self.stream_id), EventKind::WriteReady);
        self.write_vio.clone()
    }

    /// Closes both directions. Events delivered afterwards are absorbed.
    pub fn do_io_close(&mut self) {
        if self.state == TransactionState::Closed {
            return;
        }
        trace!(target: "h3", "[{}] transaction closed", self.stream_id);
        self.state = TransactionState::Closed;

        // An unresolved header block holds dynamic-table references on the
        // peer; a Stream Cancellation lets it drop them.
        {
            let mut header_adaptor = self.header_adaptor.lock().unwrap();
            if !header_adaptor.is_complete() {
                header_adaptor.cancel();
            }
        }

        self.events.cancel(EventTarget::Stream(self.stream_id));
        self.events.cancel(EventTarget::Application(self.stream_id));
        self.read_vio.lock().unwrap().disable();
        self.write_vio.lock().unwrap().disable();
        self.adapter.do_io_close();
    }

    /// Bytes arriving from the QUIC stream.
    pub fn on_stream_recv(&mut self, data: &[u8], fin: bool) {
        self.adapter.recv(data, fin);
    }

    /// Outbound wire bytes for the QUIC stream, with a FIN flag once the
    /// whole response has been framed. Returns `None` when there is nothing
    /// new to send.
    pub fn take_outgoing(&mut self) -> Option<(ByteChain, bool)> {
        let chain = self.adapter.send_ready(usize::MAX);
        let fin = self.send_complete && !self.fin_sent;
        if chain.is_empty() && !fin {
            return None;
        }
        self.fin_sent |= fin;
        Some((chain, fin))
    }

    pub fn handle_event(&mut self, kind: EventKind) -> Result<(), Http3Error> {
        // A foreign thread hands the event to the owner instead of touching
        // any state.
        if !self.events.is_home() {
            self.events
                .schedule_immediate(EventTarget::Stream(self.stream_id), kind);
            return Ok(());
        }

        if self.state == TransactionState::Closed {
            trace!(target: "h3", "[{}] {:?} ignored after close", self.stream_id, kind);
            return Ok(());
        }

        match kind {
            EventKind::ReadReady | EventKind::ReadComplete => self.process_read(kind),
            EventKind::WriteReady | EventKind::WriteComplete => self.process_write(kind),
            EventKind::Eos => {
                self.signal_app(EventKind::Eos);
                Ok(())
            }
            EventKind::InactivityTimeout | EventKind::ActiveTimeout => {
                self.abort(Http3Error::stream(
                    crate::ErrorCode::H3RequestCancelled,
                    "transaction timed out",
                ));
                Ok(())
            }
            EventKind::Error => {
                self.abort(Http3Error::stream(
                    crate::ErrorCode::H3InternalError,
                    "connection failed",
                ));
                Ok(())
            }
        }
    }

    /// The reason this transaction died, for the consumer of an ERROR event.
    pub fn error(&self) -> Option<Http3Error> {
        self.last_error
    }

    /// Closes the stream and tells the HTTP state machine it died. The close
    /// comes first so its event cancellation can't swallow the error signal.
    fn abort(&mut self, error: Http3Error) {
        let notify = self.read_vio.lock().unwrap().is_active()
            || self.write_vio.lock().unwrap().is_active();
        self.last_error = Some(error);
        self.do_io_close();
        if notify {
            self.events
                .schedule_immediate(EventTarget::Application(self.stream_id), EventKind::Error);
        }
    }

    /// QPACK resolved (or failed) a header block for this stream.
    pub fn on_qpack_event(&mut self, event: &QpackEvent) -> Result<(), Http3Error> {
        if self.state == TransactionState::Closed {
            return Ok(());
        }
        match event {
            QpackEvent::DecodeComplete { section, .. } => {
                let completed = self.header_adaptor.lock().unwrap().on_decode_complete(section);
                if let Err(err) = completed {
                    if err.class == ErrorClass::Connection {
                        return Err(err);
                    }
                    debug!(target: "h3", "[{}] stream error: {}", self.stream_id, err);
                    self.abort(err);
                    return Ok(());
                }
                self.data_adaptor.lock().unwrap().finalize();
                self.signal_read_progress();
                Ok(())
            }
            QpackEvent::DecodeFailed { .. } => {
                debug!(target: "h3", "[{}] header decode failed", self.stream_id);
                self.abort(Http3Error::stream(
                    crate::ErrorCode::QpackDecompressionFailed,
                    "header block decoding failed",
                ));
                Ok(())
            }
        }
    }

    fn process_read(&mut self, kind: EventKind) -> Result<(), Http3Error> {
        self.adapter.event_delivered(kind);

        // Run the dispatcher over whatever the stream has buffered.
        let vio = self.adapter.read_vio();
        let mut buffer = std::mem::take(&mut vio.lock().unwrap().buffer);

        let mut nread = 0;
        let result = self.dispatcher.on_read_ready(
            self.stream_id,
            StreamRole::Request,
            &mut buffer,
            &mut nread,
        );

        {
            let mut vio = vio.lock().unwrap();
            vio.buffer = buffer;
            vio.ndone += nread as i64;
        }

        if let Err(err) = result {
            if err.class == ErrorClass::Connection {
                return Err(err);
            }
            debug!(target: "h3", "[{}] stream error: {}", self.stream_id, err);
            self.abort(err);
            return Ok(());
        }

        if self.header_adaptor.lock().unwrap().is_complete() {
            self.data_adaptor.lock().unwrap().finalize();
        }

        if nread > 0 {
            self.signal_read_progress();
        }

        Ok(())
    }

    fn process_write(&mut self, kind: EventKind) -> Result<(), Http3Error> {
        self.adapter.event_delivered(kind);

        let vio = self.adapter.write_vio();
        let mut buffer = std::mem::take(&mut vio.lock().unwrap().buffer);
        let result = self.collector.on_write_ready(self.stream_id, &mut buffer);
        vio.lock().unwrap().buffer = buffer;

        let (nwritten, all_done) = match result {
            Ok(ok) => ok,
            Err(err) => {
                if err.class == ErrorClass::Connection {
                    return Err(err);
                }
                debug!(target: "h3", "[{}] stream error: {}", self.stream_id, err);
                self.abort(err);
                return Ok(());
            }
        };
        self.send_complete = all_done;

        if nwritten > 0 {
            let kind = if self.write_vio.lock().unwrap().ntodo() > 0 {
                EventKind::WriteReady
            } else {
                EventKind::WriteComplete
            };
            self.signal_app(kind);
        }

        Ok(())
    }

    fn signal_read_progress(&mut self) {
        let open = self.adapter.state() == AdapterState::Open && !self.adapter.fin_received();
        let kind = if open {
            EventKind::ReadReady
        } else {
            EventKind::ReadComplete
        };
        self.signal_app(kind);
    }

    fn signal_app(&mut self, kind: EventKind) {
        if self.read_vio.lock().unwrap().is_active() || self.write_vio.lock().unwrap().is_active()
        {
            self.events
                .schedule_immediate(EventTarget::Application(self.stream_id), kind);
        }
    }

    pub fn is_response_header_sent(&self) -> bool {
        self.header_framer.lock().unwrap().is_done()
    }

    pub fn is_response_body_sent(&self) -> bool {
        self.data_framer.lock().unwrap().is_done()
    }

    /// Whether a request carries (or may still grow) a body.
    pub fn has_request_body(&self, content_length: i64, is_chunked: bool) -> bool {
        content_length > 0
            || is_chunked
            || self.data_adaptor.lock().unwrap().has_data()
            || !self.adapter.fin_received()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    fn new_transaction(events: &EventQueue) -> Transaction {
        let local = Arc::new(Mutex::new(Qpack::new(1 << 14, 4096, 10)));
        let remote = Arc::new(Mutex::new(Qpack::new(1 << 14, 4096, 10)));
        Transaction::new(0, local, remote, Metrics::new(), 10, events.clone())
    }

    fn pump(events: &EventQueue, txn: &mut Transaction) -> Vec<Event> {
        let mut app = Vec::new();
        while let Some(event) = events.poll() {
            match event.target {
                EventTarget::Stream(_) => txn.handle_event(event.kind).unwrap(),
                EventTarget::Application(_) => app.push(event),
                EventTarget::Session => {}
            }
        }
        app
    }

    #[test]
    fn response_headers_precede_data() {
        let events = EventQueue::new();
        let mut txn = new_transaction(&events);

        let body = b"hello world";
        let message = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );

        let vio = txn.do_io_write((message.len() + body.len()) as i64);
        {
            let mut vio = vio.lock().unwrap();
            vio.buffer.write(message.as_bytes());
            vio.buffer.write(body);
        }

        let app = pump(&events, &mut txn);
        assert!(app
            .iter()
            .any(|e| e.kind == EventKind::WriteComplete || e.kind == EventKind::WriteReady));

        let (wire, fin) = txn.take_outgoing().unwrap();
        assert!(fin);
        let bytes = wire.to_bytes();
        // First frame on the wire must be HEADERS (0x01), then DATA (0x00).
        assert_eq!(bytes[0], 0x01);
        let data_at = bytes
            .windows(2)
            .position(|w| w[0] == 0x00 && w[1] == body.len() as u8)
            .expect("DATA frame present");
        assert!(data_at > 0);
        assert!(bytes.ends_with(body));

        assert!(txn.is_response_header_sent());
        assert!(txn.is_response_body_sent());
    }

    #[test]
    fn data_framer_waits_for_headers() {
        let events = EventQueue::new();
        let mut txn = new_transaction(&events);

        // Body bytes only; the message head hasn't been written yet.
        let vio = txn.do_io_write(i64::MAX);
        vio.lock().unwrap().buffer.write(b"GET"); // incomplete head

        pump(&events, &mut txn);
        assert!(txn.take_outgoing().is_none());
        assert!(!txn.is_response_header_sent());
    }

    #[test]
    fn request_is_assembled_for_the_state_machine() {
        let events = EventQueue::new();
        let mut txn = new_transaction(&events);

        // Peer encodes a request with a body.
        let peer_local = Arc::new(Mutex::new(Qpack::new(1 << 14, 0, 10)));
        let mut section = FieldSection::new();
        section.push(crate::HeaderField::new(":method", "POST"));
        section.push(crate::HeaderField::new(":scheme", "https"));
        section.push(crate::HeaderField::new(":path", "/upload"));
        section.push(crate::HeaderField::new(":authority", "example.com"));
        section.push(crate::HeaderField::new("content-length", "4"));
        let mut block = Vec::new();
        peer_local.lock().unwrap().encode(0, &section, &mut block).unwrap();

        let mut wire = Vec::new();
        Frame::Headers(HeadersFrame::new(Bytes::from(block))).encode(&mut wire);
        Frame::Data(DataFrame::new(Bytes::from_static(b"ping"))).encode(&mut wire);

        let read_vio = txn.do_io_read(i64::MAX);
        txn.on_stream_recv(&wire, true);
        let app = pump(&events, &mut txn);

        // Header decode completed synchronously (static-only block); route
        // the qpack event as the session would.
        let remote = txn.header_adaptor.lock().unwrap().qpack.clone();
        while let Some(event) = remote.lock().unwrap().poll_event() {
            txn.on_qpack_event(&event).unwrap();
        }
        let mut app2 = pump(&events, &mut txn);
        let mut all = app;
        all.append(&mut app2);
        assert!(all.iter().any(|e| matches!(
            e.kind,
            EventKind::ReadReady | EventKind::ReadComplete
        )));

        let assembled = read_vio.lock().unwrap().buffer.to_bytes();
        let text = String::from_utf8(assembled.to_vec()).unwrap();
        assert!(text.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\nping"));

        assert!(txn.has_request_body(4, false));
    }

    #[test]
    fn events_after_close_are_absorbed() {
        let events = EventQueue::new();
        let mut txn = new_transaction(&events);
        txn.do_io_read(i64::MAX);

        txn.do_io_close();
        assert_eq!(txn.state(), TransactionState::Closed);
        assert!(events.is_empty());

        // Closing again and delivering stale events changes nothing.
        txn.do_io_close();
        txn.handle_event(EventKind::ReadReady).unwrap();
        txn.on_stream_recv(b"\x00\x01\xaa", false);
        assert!(events.is_empty());
    }

    #[test]
    fn reserved_frame_closes_only_the_stream() {
        let events = EventQueue::new();
        let mut txn = new_transaction(&events);
        txn.do_io_read(i64::MAX);

        // Reserved type 0x06 on the request stream.
        txn.on_stream_recv(&[0x06, 0x04, 0x11, 0x22, 0x33, 0x44], false);
        let app = pump(&events, &mut txn);
        assert!(app.iter().any(|e| e.kind == EventKind::Error));
        assert_eq!(txn.state(), TransactionState::Closed);
        assert_eq!(
            txn.error().unwrap().code,
            crate::ErrorCode::H3FrameUnexpected
        );
    }
}
