use std::sync::{Arc, Mutex};

use crate::{ByteChain, EventTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOp {
    Read,
    Write,
    None,
}

/// A virtual I/O channel: a buffer plus byte accounting, shared between the
/// producer and consumer driving it.
///
/// `nbytes` is the total the operation wants to move (`i64::MAX` meaning
/// "unbounded until FIN"); `ndone` advances monotonically as progress is
/// made; `ntodo()` is what remains. `target` is where completion events for
/// this channel are delivered.
#[derive(Debug)]
pub struct Vio {
    pub buffer: ByteChain,
    pub target: Option<EventTarget>,
    pub nbytes: i64,
    pub ndone: i64,
    pub op: VioOp,
}

impl Vio {
    pub fn idle() -> Self {
        Self {
            buffer: ByteChain::new(),
            target: None,
            nbytes: 0,
            ndone: 0,
            op: VioOp::None,
        }
    }

    pub fn arm(&mut self, op: VioOp, target: Option<EventTarget>, nbytes: i64) {
        self.target = target;
        self.nbytes = nbytes;
        self.ndone = 0;
        self.op = op;
    }

    pub fn ntodo(&self) -> i64 {
        self.nbytes - self.ndone
    }

    pub fn is_active(&self) -> bool {
        self.op != VioOp::None
    }

    /// Tears the channel down, as `do_io_close` requires.
    pub fn disable(&mut self) {
        self.buffer.clear();
        self.nbytes = 0;
        self.ndone = 0;
        self.op = VioOp::None;
        self.target = None;
    }
}

impl Default for Vio {
    fn default() -> Self {
        Self::idle()
    }
}

pub type SharedVio = Arc<Mutex<Vio>>;

pub fn shared_vio() -> SharedVio {
    Arc::new(Mutex::new(Vio::idle()))
}
