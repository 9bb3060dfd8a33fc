use log::trace;

use crate::{
    shared_vio, ByteChain, EventKind, EventQueue, EventTarget, SharedVio, VioOp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Open,
    Closed,
}

// The event kinds the adapter coalesces: at most one of each may be
// outstanding at a time.
const COALESCED: [EventKind; 5] = [
    EventKind::ReadReady,
    EventKind::ReadComplete,
    EventKind::WriteReady,
    EventKind::WriteComplete,
    EventKind::Eos,
];

fn coalesce_index(kind: EventKind) -> Option<usize> {
    COALESCED.iter().position(|k| *k == kind)
}

/// Bridges one QUIC stream's byte flow to a pair of VIOs.
///
/// Inbound stream bytes are appended to the read VIO's buffer; the write
/// VIO's buffer is drained toward the transport with `send_ready`. Each
/// direction signals its consumer with READ/WRITE READY or COMPLETE events,
/// coalesced so that repeated encouragement doesn't flood the queue.
pub struct StreamVioAdapter {
    stream_id: u64,
    state: AdapterState,
    events: EventQueue,
    read_vio: SharedVio,
    write_vio: SharedVio,
    total_received: u64,
    fin_received: bool,
    outstanding: [bool; COALESCED.len()],
}

impl StreamVioAdapter {
    pub fn new(stream_id: u64, events: EventQueue) -> Self {
        Self {
            stream_id,
            state: AdapterState::Open,
            events,
            read_vio: shared_vio(),
            write_vio: shared_vio(),
            total_received: 0,
            fin_received: false,
            outstanding: [false; COALESCED.len()],
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Arms the read side: inbound bytes are appended to the VIO buffer up
    /// to `nbytes`, and `target` is signalled as they land.
    pub fn do_io_read(&mut self, target: EventTarget, nbytes: i64) -> SharedVio {
        self.read_vio
            .lock()
            .unwrap()
            .arm(VioOp::Read, Some(target), nbytes);
        self.read_vio.clone()
    }

    /// Arms the write side: the VIO buffer is drained toward the QUIC stream
    /// and `target` is signalled as capacity frees up.
    pub fn do_io_write(&mut self, target: EventTarget, nbytes: i64) -> SharedVio {
        self.write_vio
            .lock()
            .unwrap()
            .arm(VioOp::Write, Some(target), nbytes);
        self.write_vio.clone()
    }

    pub fn read_vio(&self) -> SharedVio {
        self.read_vio.clone()
    }

    pub fn write_vio(&self) -> SharedVio {
        self.write_vio.clone()
    }

    /// Closes the adapter. Queued events for this stream are cancelled; any
    /// later activity is absorbed silently. Calling this twice changes
    /// nothing further.
    pub fn do_io_close(&mut self) {
        if self.state == AdapterState::Closed {
            return;
        }
        trace!(target: "h3", "[{}] adapter closed", self.stream_id);
        self.state = AdapterState::Closed;
        self.events.cancel(EventTarget::Stream(self.stream_id));
        self.outstanding = [false; COALESCED.len()];
        self.read_vio.lock().unwrap().disable();
        self.write_vio.lock().unwrap().disable();
    }

    /// Delivers inbound stream bytes (with optional FIN) into the read VIO.
    pub fn recv(&mut self, data: &[u8], fin: bool) {
        if self.state == AdapterState::Closed {
            return;
        }

        {
            let mut vio = self.read_vio.lock().unwrap();
            if vio.op != VioOp::Read {
                trace!(target: "h3", "[{}] dropping {} bytes: read side not armed", self.stream_id, data.len());
                return;
            }

            vio.buffer.write(data);
            self.total_received += data.len() as u64;
            if fin {
                self.fin_received = true;
                // The unbounded read resolves to the actual stream length.
                vio.nbytes = self.total_received as i64;
            }
        }

        self.encourage_read();
    }

    /// Signals the read-side consumer, if no signal of that kind is already
    /// outstanding.
    pub fn encourage_read(&mut self) {
        let (target, kind) = {
            let vio = self.read_vio.lock().unwrap();
            if vio.op != VioOp::Read {
                return;
            }
            let Some(target) = vio.target else { return };
            let kind = if vio.nbytes == i64::MAX {
                EventKind::ReadReady
            } else {
                EventKind::ReadComplete
            };
            (target, kind)
        };
        self.schedule_coalesced(target, kind);
    }

    /// Signals the write-side producer.
    pub fn encourage_write(&mut self) {
        let (target, kind) = {
            let vio = self.write_vio.lock().unwrap();
            if vio.op != VioOp::Write {
                return;
            }
            let Some(target) = vio.target else { return };
            let kind = if vio.ntodo() > 0 {
                EventKind::WriteReady
            } else {
                EventKind::WriteComplete
            };
            (target, kind)
        };
        self.schedule_coalesced(target, kind);
    }

    /// Takes up to `max` outbound bytes for the transport, advancing the
    /// write VIO.
    pub fn send_ready(&mut self, max: usize) -> ByteChain {
        if self.state == AdapterState::Closed {
            return ByteChain::new();
        }
        let mut vio = self.write_vio.lock().unwrap();
        if vio.op != VioOp::Write {
            return ByteChain::new();
        }
        let chunk = vio.buffer.take(max);
        vio.ndone += chunk.len() as i64;
        chunk
    }

    /// Whether the write side has delivered everything it ever will.
    pub fn is_send_complete(&self) -> bool {
        let vio = self.write_vio.lock().unwrap();
        vio.op == VioOp::Write && vio.nbytes != i64::MAX && vio.ntodo() == 0 && vio.buffer.is_empty()
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Signals end-of-stream to the read-side consumer.
    pub fn notify_eos(&mut self) {
        let target = {
            let vio = self.read_vio.lock().unwrap();
            if vio.op != VioOp::Read {
                return;
            }
            match vio.target {
                Some(target) => target,
                None => return,
            }
        };
        self.schedule_coalesced(target, EventKind::Eos);
    }

    /// The consumer acknowledges a delivered event, re-enabling that kind.
    pub fn event_delivered(&mut self, kind: EventKind) {
        if let Some(index) = coalesce_index(kind) {
            self.outstanding[index] = false;
        }
    }

    fn schedule_coalesced(&mut self, target: EventTarget, kind: EventKind) {
        if self.state == AdapterState::Closed {
            return;
        }
        match coalesce_index(kind) {
            Some(index) => {
                if self.outstanding[index] {
                    return;
                }
                self.outstanding[index] = true;
                self.events.schedule_immediate(target, kind);
            }
            None => self.events.schedule_immediate(target, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    fn drain(events: &EventQueue) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = events.poll() {
            out.push(event);
        }
        out
    }

    #[test]
    fn recv_appends_and_signals() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events.clone());
        let vio = adapter.do_io_read(EventTarget::Stream(0), i64::MAX);

        adapter.recv(b"hello", false);
        assert_eq!(vio.lock().unwrap().buffer.len(), 5);
        assert_eq!(
            drain(&events),
            vec![Event {
                target: EventTarget::Stream(0),
                kind: EventKind::ReadReady
            }]
        );
    }

    #[test]
    fn read_events_coalesce() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events.clone());
        adapter.do_io_read(EventTarget::Stream(0), i64::MAX);

        adapter.recv(b"a", false);
        adapter.recv(b"b", false);
        adapter.recv(b"c", false);
        assert_eq!(drain(&events).len(), 1);

        // Once the consumer acknowledges, the next signal flows again.
        adapter.event_delivered(EventKind::ReadReady);
        adapter.recv(b"d", false);
        assert_eq!(drain(&events).len(), 1);
    }

    #[test]
    fn fin_turns_reads_into_complete() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events.clone());
        let vio = adapter.do_io_read(EventTarget::Stream(0), i64::MAX);

        adapter.recv(b"abc", true);
        assert!(adapter.fin_received());
        assert_eq!(vio.lock().unwrap().nbytes, 3);
        assert_eq!(
            drain(&events),
            vec![Event {
                target: EventTarget::Stream(0),
                kind: EventKind::ReadComplete
            }]
        );
    }

    #[test]
    fn send_ready_advances_write_vio() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events);
        let vio = adapter.do_io_write(EventTarget::Stream(0), i64::MAX);

        vio.lock().unwrap().buffer.write(b"response bytes");
        let chunk = adapter.send_ready(8);
        assert_eq!(chunk.to_bytes().as_ref(), b"response");
        assert_eq!(vio.lock().unwrap().ndone, 8);

        let rest = adapter.send_ready(100);
        assert_eq!(rest.to_bytes().as_ref(), b" bytes");
    }

    #[test]
    fn close_is_idempotent_and_quiet() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events.clone());
        adapter.do_io_read(EventTarget::Stream(0), i64::MAX);

        adapter.recv(b"x", false);
        adapter.do_io_close();
        assert_eq!(adapter.state(), AdapterState::Closed);
        // The queued read event was cancelled along with the close.
        assert!(events.is_empty());

        // Closed adapters absorb everything.
        adapter.recv(b"y", false);
        adapter.encourage_read();
        assert!(events.is_empty());
        assert!(adapter.send_ready(10).is_empty());

        // A second close observes the identical state.
        adapter.do_io_close();
        assert_eq!(adapter.state(), AdapterState::Closed);
        assert!(events.is_empty());
    }

    #[test]
    fn unarmed_read_drops_bytes() {
        let events = EventQueue::new();
        let mut adapter = StreamVioAdapter::new(0, events.clone());
        adapter.recv(b"early", false);
        assert!(events.is_empty());
        assert!(adapter.read_vio().lock().unwrap().buffer.is_empty());
    }
}
