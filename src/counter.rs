use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Frame, FrameHandler, FrameType, Http3Error, StreamRole};

/// Process-wide frame counters. Constructed at program startup and handed to
/// each session rather than living in a global.
#[derive(Default)]
pub struct Metrics {
    frames_in: [AtomicU64; FrameType::COUNT],
    total_frames_in: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, typ: FrameType) {
        self.frames_in[typ.index()].fetch_add(1, Ordering::Relaxed);
        self.total_frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_in(&self, typ: FrameType) -> u64 {
        self.frames_in[typ.index()].load(Ordering::Relaxed)
    }

    pub fn total_frames_in(&self) -> u64 {
        self.total_frames_in.load(Ordering::Relaxed)
    }
}

/// A dispatcher handler counting every received frame, per type and in the
/// shared process-wide metrics.
pub struct FrameCounter {
    metrics: Arc<Metrics>,
    counts: [u64; FrameType::COUNT],
}

impl FrameCounter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            counts: [0; FrameType::COUNT],
        }
    }

    pub fn count(&self, typ: FrameType) -> u64 {
        self.counts[typ.index()]
    }
}

impl FrameHandler for FrameCounter {
    fn interests(&self) -> Vec<FrameType> {
        FrameType::ALL.to_vec()
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        _frame_seq: u64,
        _role: StreamRole,
    ) -> Result<(), Http3Error> {
        let typ = frame.frame_type();
        self.counts[typ.index()] += 1;
        self.metrics.record(typ);
        Ok(())
    }
}
