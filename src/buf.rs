use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// A block-chained byte buffer.
///
/// Producers append blocks (or copied slices) at the tail; a consumer reads,
/// peeks, and consumes from the head. Blocks are reference-counted [`Bytes`],
/// so cloning the chain for a lookahead reader is cheap.
#[derive(Default, Clone)]
pub struct ByteChain {
    blocks: VecDeque<Bytes>,
    len: usize,
}

impl ByteChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into a new tail block.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.append(Bytes::copy_from_slice(data));
    }

    /// Appends a block without copying.
    pub fn append(&mut self, block: Bytes) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.blocks.push_back(block);
    }

    /// Moves every block of `other` onto the tail of `self`.
    pub fn append_chain(&mut self, other: &mut ByteChain) {
        self.len += other.len;
        other.len = 0;
        self.blocks.append(&mut other.blocks);
    }

    /// Splits off up to `max` bytes from the head into a new chain.
    pub fn take(&mut self, max: usize) -> ByteChain {
        let mut out = ByteChain::new();
        while out.len < max {
            let Some(mut block) = self.blocks.pop_front() else {
                break;
            };
            let want = max - out.len;
            if block.len() > want {
                out.append(block.split_to(want));
                self.blocks.push_front(block);
            } else {
                out.append(block);
            }
        }
        self.len -= out.len;
        out
    }

    /// Copies up to `dst.len()` bytes into `dst` and consumes them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// Copies up to `dst.len()` bytes into `dst` without consuming.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for block in &self.blocks {
            if copied == dst.len() {
                break;
            }
            let n = (dst.len() - copied).min(block.len());
            dst[copied..copied + n].copy_from_slice(&block[..n]);
            copied += n;
        }
        copied
    }

    /// Discards `n` bytes from the head. Panics if fewer are buffered.
    pub fn consume(&mut self, mut n: usize) {
        assert!(n <= self.len, "consumed past the end of the chain");
        self.len -= n;
        while n > 0 {
            let block = self.blocks.front_mut().unwrap();
            if block.len() > n {
                block.advance(n);
                return;
            }
            n -= block.len();
            self.blocks.pop_front();
        }
    }

    /// Contiguous bytes available at the head without crossing a block
    /// boundary.
    pub fn block_read_avail(&self) -> usize {
        self.blocks.front().map_or(0, Bytes::len)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Collects the whole chain into one `Bytes`. Single-block chains are
    /// returned without copying.
    pub fn to_bytes(&self) -> Bytes {
        match self.blocks.len() {
            0 => Bytes::new(),
            1 => self.blocks[0].clone(),
            _ => {
                let mut out = Vec::with_capacity(self.len);
                for block in &self.blocks {
                    out.extend_from_slice(block);
                }
                Bytes::from(out)
            }
        }
    }
}

impl Buf for ByteChain {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.blocks.front().map_or(&[], |b| &b[..])
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

impl std::fmt::Debug for ByteChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChain")
            .field("blocks", &self.blocks.len())
            .field("len", &self.len)
            .finish()
    }
}
