use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Cooperative events exchanged between the engine's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReadReady,
    ReadComplete,
    WriteReady,
    WriteComplete,
    Eos,
    Error,
    InactivityTimeout,
    ActiveTimeout,
}

/// Who an event is for. `Stream` events are routed by the session to the
/// owning transaction or unidirectional-stream handler; `Application` events
/// are consumed by the HTTP state machine above the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTarget {
    Session,
    Stream(u64),
    Application(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub target: EventTarget,
    pub kind: EventKind,
}

struct EventQueueInner {
    home: ThreadId,
    queue: Mutex<VecDeque<Event>>,
}

/// The per-connection event queue. Every object of a connection is pinned to
/// the thread that created the queue; `is_home()` lets entry points detect a
/// foreign-thread caller and defer by scheduling instead of touching state.
/// Foreign threads push through the same mutex-protected queue, which is the
/// message channel into the owner.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<EventQueueInner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventQueueInner {
                home: thread::current().id(),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Whether the caller runs on the connection's owner thread.
    pub fn is_home(&self) -> bool {
        thread::current().id() == self.inner.home
    }

    pub fn schedule_immediate(&self, target: EventTarget, kind: EventKind) {
        self.inner
            .queue
            .lock()
            .unwrap()
            .push_back(Event { target, kind });
    }

    /// Takes the next queued event. Only the owner thread consumes.
    pub fn poll(&self) -> Option<Event> {
        debug_assert!(self.is_home(), "events are consumed on the owner thread");
        self.inner.queue.lock().unwrap().pop_front()
    }

    /// Drops every queued event for `target`.
    pub fn cancel(&self, target: EventTarget) {
        self.inner
            .queue
            .lock()
            .unwrap()
            .retain(|e| e.target != target);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().unwrap().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = EventQueue::new();
        queue.schedule_immediate(EventTarget::Stream(0), EventKind::ReadReady);
        queue.schedule_immediate(EventTarget::Session, EventKind::WriteReady);

        assert_eq!(
            queue.poll(),
            Some(Event {
                target: EventTarget::Stream(0),
                kind: EventKind::ReadReady
            })
        );
        assert_eq!(
            queue.poll(),
            Some(Event {
                target: EventTarget::Session,
                kind: EventKind::WriteReady
            })
        );
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn cancel_removes_only_the_target() {
        let queue = EventQueue::new();
        queue.schedule_immediate(EventTarget::Stream(0), EventKind::ReadReady);
        queue.schedule_immediate(EventTarget::Stream(4), EventKind::ReadReady);
        queue.cancel(EventTarget::Stream(0));

        assert_eq!(
            queue.poll(),
            Some(Event {
                target: EventTarget::Stream(4),
                kind: EventKind::ReadReady
            })
        );
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn foreign_thread_posts_through_the_queue() {
        let queue = EventQueue::new();
        let handle = queue.clone();
        std::thread::spawn(move || {
            assert!(!handle.is_home());
            handle.schedule_immediate(EventTarget::Session, EventKind::Error);
        })
        .join()
        .unwrap();

        assert!(queue.is_home());
        assert_eq!(
            queue.poll(),
            Some(Event {
                target: EventTarget::Session,
                kind: EventKind::Error
            })
        );
    }
}
