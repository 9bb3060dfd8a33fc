use std::sync::{Arc, Mutex};

use log::trace;

use crate::{ByteChain, Http3Error};

/// Largest frame payload a generator is asked for in one call.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// A producer of outbound frames for one stream.
pub trait FrameGenerator: Send {
    /// Returns the next frame, or `None` when nothing is ready yet.
    /// `max_size` bounds the payload of the produced frame.
    fn generate_frame(&mut self, max_size: usize) -> Result<Option<crate::Frame>, Http3Error>;

    fn is_done(&self) -> bool;
}

pub type SharedGenerator = Arc<Mutex<dyn FrameGenerator>>;

/// Drains an ordered list of generators on each write-ready signal,
/// serializing every produced frame onto the stream writer.
#[derive(Default)]
pub struct FrameCollector {
    generators: Vec<SharedGenerator>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generator(&mut self, generator: SharedGenerator) {
        self.generators.push(generator);
    }

    /// Returns the number of bytes written and whether every generator has
    /// finished.
    pub fn on_write_ready(
        &mut self,
        stream_id: u64,
        writer: &mut ByteChain,
    ) -> Result<(usize, bool), Http3Error> {
        let mut all_done = true;
        let mut nwritten = 0;

        for generator in &self.generators {
            let mut generator = generator.lock().unwrap();
            if generator.is_done() {
                continue;
            }

            if let Some(frame) = generator.generate_frame(MAX_FRAME_PAYLOAD)? {
                let mut chain = frame.to_chain();
                trace!(
                    target: "h3",
                    "[TX] [{}] {:?} size={}",
                    stream_id,
                    frame.frame_type(),
                    chain.len()
                );
                nwritten += chain.len();
                writer.append_chain(&mut chain);
            }

            all_done &= generator.is_done();
        }

        Ok((nwritten, all_done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataFrame, Frame};
    use bytes::Bytes;

    /// Emits one DATA frame per payload, in order.
    struct ScriptedGenerator {
        payloads: Vec<Bytes>,
    }

    impl FrameGenerator for ScriptedGenerator {
        fn generate_frame(&mut self, _max_size: usize) -> Result<Option<Frame>, Http3Error> {
            if self.payloads.is_empty() {
                return Ok(None);
            }
            Ok(Some(Frame::Data(DataFrame::new(self.payloads.remove(0)))))
        }

        fn is_done(&self) -> bool {
            self.payloads.is_empty()
        }
    }

    #[test]
    fn drains_generators_in_order() {
        let mut collector = FrameCollector::new();
        collector.add_generator(Arc::new(Mutex::new(ScriptedGenerator {
            payloads: vec![Bytes::from_static(b"aa")],
        })));
        collector.add_generator(Arc::new(Mutex::new(ScriptedGenerator {
            payloads: vec![Bytes::from_static(b"bbb")],
        })));

        let mut writer = ByteChain::new();
        let (nwritten, all_done) = collector.on_write_ready(0, &mut writer).unwrap();
        assert_eq!(nwritten, 4 + 5);
        assert!(all_done);
        assert_eq!(
            writer.to_bytes().as_ref(),
            &[0x00, 0x02, b'a', b'a', 0x00, 0x03, b'b', b'b', b'b']
        );

        // Everything is done; nothing further is produced.
        let (nwritten, all_done) = collector.on_write_ready(0, &mut writer).unwrap();
        assert_eq!(nwritten, 0);
        assert!(all_done);
    }

    #[test]
    fn not_done_generator_holds_all_done_down() {
        struct NeverDone;
        impl FrameGenerator for NeverDone {
            fn generate_frame(&mut self, _max: usize) -> Result<Option<Frame>, Http3Error> {
                Ok(None)
            }
            fn is_done(&self) -> bool {
                false
            }
        }

        let mut collector = FrameCollector::new();
        collector.add_generator(Arc::new(Mutex::new(NeverDone)));

        let mut writer = ByteChain::new();
        let (nwritten, all_done) = collector.on_write_ready(0, &mut writer).unwrap();
        assert_eq!(nwritten, 0);
        assert!(!all_done);
    }
}
