use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::{
    is_bidirectional, ByteChain, Config, ErrorCode, Event, EventKind, EventQueue, EventTarget,
    Frame, FrameCollector, FrameDispatcher, FrameGenerator, FrameHandler, FrameType,
    Http3Error, Metrics, ProtocolEnforcer, Qpack, SettingsFrame, SettingsId, StreamKind,
    StreamRole, StreamVioAdapter, Transaction,
};

/// Whether this end of the connection is serving or requesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionContext {
    Client,
    Server,
}

/// The peer's SETTINGS, as last received on its control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    pub header_table_size: u64,
    pub max_field_section_size: u64,
    pub qpack_blocked_streams: u64,
    pub num_placeholders: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: crate::DEFAULT_HEADER_TABLE_SIZE as u64,
            max_field_section_size: crate::DEFAULT_MAX_FIELD_SECTION_SIZE as u64,
            qpack_blocked_streams: crate::DEFAULT_QPACK_BLOCKED_STREAMS as u64,
            num_placeholders: crate::DEFAULT_NUM_PLACEHOLDERS as u64,
        }
    }
}

/// Applies a received SETTINGS frame to the session's remote parameters and
/// passes the QPACK-relevant limits on to the local encoder.
pub struct SettingsHandler {
    peer_settings: Arc<Mutex<PeerSettings>>,
    local_qpack: Arc<Mutex<Qpack>>,
}

impl SettingsHandler {
    pub fn new(peer_settings: Arc<Mutex<PeerSettings>>, local_qpack: Arc<Mutex<Qpack>>) -> Self {
        Self {
            peer_settings,
            local_qpack,
        }
    }
}

impl FrameHandler for SettingsHandler {
    fn interests(&self) -> Vec<FrameType> {
        vec![FrameType::Settings]
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        _frame_seq: u64,
        _role: StreamRole,
    ) -> Result<(), Http3Error> {
        let Frame::Settings(settings) = frame else {
            return Ok(());
        };

        if let Some(err) = settings.error() {
            return Err(err);
        }

        let mut peer = self.peer_settings.lock().unwrap();
        let mut qpack = self.local_qpack.lock().unwrap();

        if let Some(value) = settings.get(SettingsId::HEADER_TABLE_SIZE) {
            peer.header_table_size = value;
            qpack.update_max_table_size(value as usize);
        }
        if let Some(value) = settings.get(SettingsId::MAX_FIELD_SECTION_SIZE) {
            peer.max_field_section_size = value;
            qpack.update_max_field_section_size(value);
        }
        if let Some(value) = settings.get(SettingsId::QPACK_BLOCKED_STREAMS) {
            peer.qpack_blocked_streams = value;
            qpack.update_max_blocking_streams(value as usize);
        }
        if let Some(value) = settings.get(SettingsId::NUM_PLACEHOLDERS) {
            peer.num_placeholders = value;
        }

        trace!(target: "h3", "peer settings applied: {:?}", *peer);
        Ok(())
    }
}

/// Emits the local SETTINGS frame, once, on the control stream. Only options
/// differing from the protocol defaults are included; NUM_PLACEHOLDERS is
/// offered only when serving. The control stream never finishes, so this
/// generator never reports done.
pub struct SettingsFramer {
    config: Config,
    context: SessionContext,
    is_sent: bool,
}

impl SettingsFramer {
    pub fn new(config: Config, context: SessionContext) -> Self {
        Self {
            config,
            context,
            is_sent: false,
        }
    }
}

impl FrameGenerator for SettingsFramer {
    fn generate_frame(&mut self, _max_size: usize) -> Result<Option<Frame>, Http3Error> {
        if self.is_sent {
            return Ok(None);
        }
        self.is_sent = true;

        let mut frame = SettingsFrame::new();
        if self.config.header_table_size != crate::DEFAULT_HEADER_TABLE_SIZE {
            frame.set(
                SettingsId::HEADER_TABLE_SIZE,
                self.config.header_table_size as u64,
            );
        }
        if self.config.max_field_section_size != crate::DEFAULT_MAX_FIELD_SECTION_SIZE {
            frame.set(
                SettingsId::MAX_FIELD_SECTION_SIZE,
                self.config.max_field_section_size as u64,
            );
        }
        if self.config.qpack_blocked_streams != crate::DEFAULT_QPACK_BLOCKED_STREAMS {
            frame.set(
                SettingsId::QPACK_BLOCKED_STREAMS,
                self.config.qpack_blocked_streams as u64,
            );
        }
        if self.context == SessionContext::Server
            && self.config.num_placeholders != crate::DEFAULT_NUM_PLACEHOLDERS
        {
            frame.set(
                SettingsId::NUM_PLACEHOLDERS,
                self.config.num_placeholders as u64,
            );
        }

        Ok(Some(Frame::Settings(frame)))
    }

    fn is_done(&self) -> bool {
        false
    }
}

/// One HTTP/3 session per QUIC connection.
///
/// Owns the QPACK pair, the control-stream dispatcher and collector, the
/// classification of remote unidirectional streams, and the set of active
/// transactions keyed by stream id. The embedding layer feeds stream bytes
/// in with `on_stream_recv`, turns the crank with `process_events`, and
/// ships `outgoing` back to the transport.
pub struct Session {

    context: SessionContext,
    config: Config,
    metrics: Arc<Metrics>,
    events: EventQueue,

    local_qpack: Arc<Mutex<Qpack>>,
    remote_qpack: Arc<Mutex<Qpack>>,
    peer_settings: Arc<Mutex<PeerSettings>>,

    control_dispatcher: FrameDispatcher,
    control_collector: FrameCollector,

    local_uni: HashMap<u64, (StreamRole, StreamVioAdapter)>,
    remote_uni: HashMap<u64, StreamVioAdapter>,
    remote_roles: HashMap<u64, StreamRole>,
    remote_control_stream: Option<u64>,
    local_control_stream: Option<u64>,

    transactions: HashMap<u64, Transaction>,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(context: SessionContext, config: Config, metrics: Arc<Metrics>) -> Self {
        let events = EventQueue::new();

        // The local instance encodes; the remote instance decodes what the
        // peer encoded.
        let local_qpack = Arc::new(Mutex::new(Qpack::new(
            config.max_field_section_size as u64,
            config.header_table_size as usize,
            config.qpack_blocked_streams as usize,
        )));
        let remote_qpack = Arc::new(Mutex::new(Qpack::new(
            config.max_field_section_size as u64,
            config.header_table_size as usize,
            config.qpack_blocked_streams as usize,
        )));
        let peer_settings = Arc::new(Mutex::new(PeerSettings::default()));

        let mut control_dispatcher = FrameDispatcher::new(config.max_settings);
        control_dispatcher.add_handler(Arc::new(Mutex::new(ProtocolEnforcer::new())));
        control_dispatcher.add_handler(Arc::new(Mutex::new(crate::FrameCounter::new(
            metrics.clone(),
        ))));
        control_dispatcher.add_handler(Arc::new(Mutex::new(SettingsHandler::new(
            peer_settings.clone(),
            local_qpack.clone(),
        ))));

        let mut control_collector = FrameCollector::new();
        control_collector.add_generator(Arc::new(Mutex::new(SettingsFramer::new(
            config, context,
        ))));

        Self {
            context,
            config,
            metrics,
            events,
            local_qpack,
            remote_qpack,
            peer_settings,
            control_dispatcher,
            control_collector,
            local_uni: HashMap::new(),
            remote_uni: HashMap::new(),
            remote_roles: HashMap::new(),
            remote_control_stream: None,
            local_control_stream: None,
            transactions: HashMap::new(),
            closed: false,
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context
    }

    pub fn events(&self) -> EventQueue {
        self.events.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn peer_settings(&self) -> PeerSettings {
        *self.peer_settings.lock().unwrap()
    }

    pub fn local_qpack(&self) -> Arc<Mutex<Qpack>> {
        self.local_qpack.clone()
    }

    pub fn remote_qpack(&self) -> Arc<Mutex<Qpack>> {
        self.remote_qpack.clone()
    }

    /// Brings the session up on three locally created unidirectional
    /// streams: control, QPACK encoder, and QPACK decoder. Their stream-type
    /// bytes go out first; SETTINGS follows on the control stream.
    pub fn start(&mut self, control_id: u64, encoder_id: u64, decoder_id: u64) {
        for (id, kind, role) in [
            (control_id, StreamKind::CONTROL, StreamRole::Control),
            (encoder_id, StreamKind::QPACK_ENCODER, StreamRole::QpackEncoder),
            (decoder_id, StreamKind::QPACK_DECODER, StreamRole::QpackDecoder),
        ] {
            let mut adapter = StreamVioAdapter::new(id, self.events.clone());
            let vio = adapter.do_io_write(EventTarget::Stream(id), i64::MAX);
            let mut kind_byte = Vec::with_capacity(1);
            kind.encode(&mut kind_byte);
            vio.lock().unwrap().buffer.write(&kind_byte);
            self.local_uni.insert(id, (role, adapter));
            debug!(target: "h3", "[{}] {:?} stream is created", id, role);
        }

        self.local_control_stream = Some(control_id);
        self.local_qpack.lock().unwrap().set_encoder_stream(encoder_id);
        self.remote_qpack.lock().unwrap().set_decoder_stream(decoder_id);

        self.events
            .schedule_immediate(EventTarget::Stream(control_id), EventKind::WriteReady);
    }

    /// Creates (or returns) the transaction for a bidirectional stream. The
    /// server side creates transactions lazily as request streams arrive;
    /// clients call this before writing a request.
    pub fn new_transaction(&mut self, stream_id: u64) -> &mut Transaction {
        let local_qpack = self.local_qpack.clone();
        let remote_qpack = self.remote_qpack.clone();
        let metrics = self.metrics.clone();
        let max_settings = self.config.max_settings;
        let events = self.events.clone();
        self.transactions.entry(stream_id).or_insert_with(|| {
            debug!(target: "h3", "[{}] transaction created", stream_id);
            Transaction::new(
                stream_id,
                local_qpack,
                remote_qpack,
                metrics,
                max_settings,
                events,
            )
        })
    }

    pub fn transaction_mut(&mut self, stream_id: u64) -> Option<&mut Transaction> {
        self.transactions.get_mut(&stream_id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Feeds bytes received on any QUIC stream into the session.
    pub fn on_stream_recv(&mut self, stream_id: u64, data: &[u8], fin: bool) {
        if self.closed {
            return;
        }

        if is_bidirectional(stream_id) {
            self.new_transaction(stream_id).on_stream_recv(data, fin);
            return;
        }

        let events = self.events.clone();
        let adapter = self.remote_uni.entry(stream_id).or_insert_with(|| {
            let mut adapter = StreamVioAdapter::new(stream_id, events);
            adapter.do_io_read(EventTarget::Stream(stream_id), i64::MAX);
            adapter
        });
        adapter.recv(data, fin);
    }

    /// Runs queued events to quiescence. Application-targeted events are
    /// returned for the HTTP state machine; a connection-fatal error tears
    /// the session down and is returned for the transport close.
    pub fn process_events(&mut self) -> Result<Vec<Event>, Http3Error> {
        let mut app = Vec::new();

        while let Some(event) = self.events.poll() {
            let result = match event.target {
                EventTarget::Application(_) => {
                    app.push(event);
                    Ok(())
                }
                EventTarget::Session => self.handle_session_event(event.kind),
                EventTarget::Stream(id) => self.handle_stream_event(id, event.kind),
            };

            if let Err(err) = result.and_then(|()| self.route_qpack_events()) {
                self.teardown();
                return Err(err);
            }
        }

        self.flush_qpack_streams();
        Ok(app)
    }

    /// Outbound wire bytes per stream, with a FIN marker for finished
    /// request streams.
    pub fn outgoing(&mut self) -> Vec<(u64, ByteChain, bool)> {
        let mut out = Vec::new();

        for (id, (_, adapter)) in self.local_uni.iter_mut() {
            let chain = adapter.send_ready(usize::MAX);
            if !chain.is_empty() {
                out.push((*id, chain, false));
            }
        }

        for (id, txn) in self.transactions.iter_mut() {
            if let Some((chain, fin)) = txn.take_outgoing() {
                out.push((*id, chain, fin));
            }
        }

        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Timeouts and transport errors reach every transaction.
    pub fn on_inactivity_timeout(&mut self) {
        self.broadcast(EventKind::InactivityTimeout);
        self.teardown();
    }

    pub fn on_active_timeout(&mut self) {
        self.broadcast(EventKind::ActiveTimeout);
        self.teardown();
    }

    pub fn on_connection_error(&mut self) {
        self.broadcast(EventKind::Error);
        self.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn broadcast(&mut self, kind: EventKind) {
        for txn in self.transactions.values_mut() {
            // Closed transactions absorb these silently.
            let _ = txn.handle_event(kind);
        }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        debug!(target: "h3", "session teardown");
        self.closed = true;
        for txn in self.transactions.values_mut() {
            txn.do_io_close();
        }
    }

    fn handle_session_event(&mut self, kind: EventKind) -> Result<(), Http3Error> {
        match kind {
            EventKind::InactivityTimeout => self.on_inactivity_timeout(),
            EventKind::ActiveTimeout => self.on_active_timeout(),
            EventKind::Error => self.on_connection_error(),
            _ => {}
        }
        Ok(())
    }

    fn handle_stream_event(&mut self, stream_id: u64, kind: EventKind) -> Result<(), Http3Error> {
        if let Some(txn) = self.transactions.get_mut(&stream_id) {
            return txn.handle_event(kind);
        }
        if self.remote_uni.contains_key(&stream_id) {
            return self.handle_uni_read(stream_id, kind);
        }
        if self.local_uni.contains_key(&stream_id) {
            return self.handle_uni_write(stream_id, kind);
        }
        trace!(target: "h3", "[{}] event {:?} for unknown stream", stream_id, kind);
        Ok(())
    }

    fn handle_uni_write(&mut self, stream_id: u64, kind: EventKind) -> Result<(), Http3Error> {
        let (role, adapter) = self.local_uni.get_mut(&stream_id).expect("checked by caller");
        adapter.event_delivered(kind);

        if *role == StreamRole::Control {
            let vio = adapter.write_vio();
            let mut buffer = std::mem::take(&mut vio.lock().unwrap().buffer);
            let result = self.control_collector.on_write_ready(stream_id, &mut buffer);
            vio.lock().unwrap().buffer = buffer;
            result?;
        }
        // QPACK streams are fed from the instruction chains in
        // `flush_qpack_streams`; nothing to do here.
        Ok(())
    }

    fn handle_uni_read(&mut self, stream_id: u64, kind: EventKind) -> Result<(), Http3Error> {
        let adapter = self.remote_uni.get_mut(&stream_id).expect("checked by caller");
        adapter.event_delivered(kind);

        // Classify the stream on its first byte.
        if !self.remote_roles.contains_key(&stream_id) {
            let vio = adapter.read_vio();
            let mut first = [0u8; 1];
            {
                let mut vio = vio.lock().unwrap();
                if vio.buffer.read(&mut first) == 0 {
                    return Ok(());
                }
                vio.ndone += 1;
            }
            let role = StreamRole::from_kind(StreamKind(crate::VarInt::from_u32(first[0] as u32)));
            debug!(target: "h3", "[{}] {:?} stream is opened", stream_id, role);

            match role {
                StreamRole::Control => {
                    if self.remote_control_stream.is_some() {
                        return Err(Http3Error::connection(
                            ErrorCode::H3StreamCreationError,
                            "only one control stream per peer is permitted",
                        ));
                    }
                    self.remote_control_stream = Some(stream_id);
                }
                StreamRole::Push => {
                    if self.context == SessionContext::Server {
                        return Err(Http3Error::connection(
                            ErrorCode::H3StreamCreationError,
                            "only servers can push",
                        ));
                    }
                }
                StreamRole::QpackEncoder => {
                    self.remote_qpack.lock().unwrap().set_encoder_stream(stream_id);
                }
                StreamRole::QpackDecoder => {
                    self.local_qpack.lock().unwrap().set_decoder_stream(stream_id);
                }
                StreamRole::Unknown | StreamRole::Request => {}
            }
            self.remote_roles.insert(stream_id, role);
        }

        let role = self.remote_roles[&stream_id];
        let vio = self.remote_uni.get_mut(&stream_id).expect("checked above").read_vio();

        match role {
            StreamRole::Control => {
                let mut buffer = std::mem::take(&mut vio.lock().unwrap().buffer);
                let mut nread = 0;
                let result = self.control_dispatcher.on_read_ready(
                    stream_id,
                    StreamRole::Control,
                    &mut buffer,
                    &mut nread,
                );
                {
                    let mut vio = vio.lock().unwrap();
                    vio.buffer = buffer;
                    vio.ndone += nread as i64;
                }
                if let Err(err) = result {
                    debug!(target: "h3", "control stream [{}] error: {}", stream_id, err);
                    // Everything illegal on the control stream kills the
                    // connection.
                    return Err(Http3Error::connection(err.code, err.reason));
                }
            }
            StreamRole::QpackEncoder => {
                let data = {
                    let mut vio = vio.lock().unwrap();
                    let len = vio.buffer.len();
                    vio.ndone += len as i64;
                    vio.buffer.take(len).to_bytes()
                };
                self.remote_qpack.lock().unwrap().on_encoder_stream_recv(&data)?;
            }
            StreamRole::QpackDecoder => {
                let data = {
                    let mut vio = vio.lock().unwrap();
                    let len = vio.buffer.len();
                    vio.ndone += len as i64;
                    vio.buffer.take(len).to_bytes()
                };
                self.local_qpack.lock().unwrap().on_decoder_stream_recv(&data)?;
            }
            _ => {
                // Unknown types (and push streams on the client) are
                // discarded without closing the connection.
                let mut vio = vio.lock().unwrap();
                let len = vio.buffer.len();
                vio.ndone += len as i64;
                vio.buffer.clear();
            }
        }

        Ok(())
    }

    /// Routes decode completions to their transactions.
    fn route_qpack_events(&mut self) -> Result<(), Http3Error> {
        loop {
            let event = self.remote_qpack.lock().unwrap().poll_event();
            let Some(event) = event else { break };
            let stream_id = match event {
                crate::QpackEvent::DecodeComplete { stream_id, .. } => stream_id,
                crate::QpackEvent::DecodeFailed { stream_id } => stream_id,
            };
            if let Some(txn) = self.transactions.get_mut(&stream_id) {
                txn.on_qpack_event(&event)?;
            }
        }
        Ok(())
    }

    /// Moves queued QPACK instructions onto their unidirectional streams.
    fn flush_qpack_streams(&mut self) {
        let encoder_id = self.local_qpack.lock().unwrap().encoder_stream_id();
        if let Some(id) = encoder_id {
            let mut chain = self.local_qpack.lock().unwrap().drain_encoder_instructions();
            if !chain.is_empty() {
                if let Some((_, adapter)) = self.local_uni.get_mut(&id) {
                    adapter
                        .write_vio()
                        .lock()
                        .unwrap()
                        .buffer
                        .append_chain(&mut chain);
                }
            }
        }

        let decoder_id = self.remote_qpack.lock().unwrap().decoder_stream_id();
        if let Some(id) = decoder_id {
            let mut chain = self.remote_qpack.lock().unwrap().drain_decoder_instructions();
            if !chain.is_empty() {
                if let Some((_, adapter)) = self.local_uni.get_mut(&id) {
                    adapter
                        .write_vio()
                        .lock()
                        .unwrap()
                        .buffer
                        .append_chain(&mut chain);
                }
            }
        }
    }
}

/// Options applied before a session is created.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// When set, only these client addresses are admitted.
    pub ip_allow: Option<Vec<IpAddr>>,
}

/// The exposed accept callback: matches the negotiated application protocol
/// and the accept options, then builds a serving session.
pub struct SessionAccept {
    options: AcceptOptions,
    config: Config,
    metrics: Arc<Metrics>,
}

impl SessionAccept {
    pub const ALPN: &'static [u8] = b"h3";

    pub fn new(options: AcceptOptions, config: Config, metrics: Arc<Metrics>) -> Self {
        Self {
            options,
            config,
            metrics,
        }
    }

    pub fn accept(&self, alpn: &[u8], remote: IpAddr) -> Result<Session, Http3Error> {
        if alpn != Self::ALPN {
            return Err(Http3Error::connection(
                ErrorCode::H3VersionFallback,
                "unsupported application protocol",
            ));
        }

        if let Some(allowed) = &self.options.ip_allow {
            if !allowed.contains(&remote) {
                return Err(Http3Error::connection(
                    ErrorCode::H3RequestRejected,
                    "client not allowed",
                ));
            }
        }

        Ok(Session::new(
            SessionContext::Server,
            self.config,
            self.metrics.clone(),
        ))
    }
}
