//! Accumulates the incoming byte stream and cuts it into blocks. Blocks
//! come out full-size except the very last one, which may be short.

use bytes::{Bytes, BytesMut};

pub struct BlockSlicer {
    buf: BytesMut,
    block_size: usize,
    content_length: u64,
    bytes_received: u64,
}

impl BlockSlicer {
    pub fn new(block_size: usize, content_length: u64) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        Self {
            buf: BytesMut::new(),
            block_size,
            content_length,
            bytes_received: 0,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.content_length
    }

    /// Bytes buffered but not yet cut into a block.
    pub fn remainder_len(&self) -> usize {
        self.buf.len()
    }

    /// Appends a chunk. The caller keeps `bytes_received` within
    /// `content_length`; the slicer only accumulates.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.bytes_received += chunk.len() as u64;
    }

    /// Cuts every buffered full-size block, in order. Once the whole stream
    /// has arrived the non-empty tail comes out too, as the final short
    /// block.
    pub fn drain_blocks(&mut self) -> Vec<Bytes> {
        let mut blocks = Vec::with_capacity(self.buf.len() / self.block_size + 1);
        while self.buf.len() >= self.block_size {
            blocks.push(self.buf.split_to(self.block_size).freeze());
        }
        if self.is_complete() && !self.buf.is_empty() {
            blocks.push(self.buf.split().freeze());
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let mut slicer = BlockSlicer::new(4, 8);
        slicer.push(b"abcdefgh");
        let blocks = slicer.drain_blocks();
        assert_eq!(blocks, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert_eq!(slicer.remainder_len(), 0);
        assert!(slicer.is_complete());
    }

    #[test]
    fn tail_held_back_until_stream_completes() {
        let mut slicer = BlockSlicer::new(4, 10);
        slicer.push(b"abcdef");
        assert_eq!(slicer.drain_blocks(), vec![Bytes::from_static(b"abcd")]);
        // "ef" is a remainder, not a block: more data may follow
        assert_eq!(slicer.remainder_len(), 2);

        slicer.push(b"ghij");
        let blocks = slicer.drain_blocks();
        assert_eq!(blocks, vec![Bytes::from_static(b"efgh"), Bytes::from_static(b"ij")]);
        assert_eq!(slicer.remainder_len(), 0);
    }

    #[test]
    fn single_short_object() {
        let mut slicer = BlockSlicer::new(1024, 3);
        slicer.push(b"abc");
        assert_eq!(slicer.drain_blocks(), vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn arbitrary_chunking_reassembles_the_stream() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let block_size = rng.gen_range(1..=64);
            let total: usize = rng.gen_range(0..=4096);
            let stream: Vec<u8> = (0..total).map(|_| rng.gen()).collect();

            let mut slicer = BlockSlicer::new(block_size, total as u64);
            let mut fed = 0;
            let mut out: Vec<u8> = Vec::new();
            while fed < total {
                let chunk = rng.gen_range(1..=total - fed);
                slicer.push(&stream[fed..fed + chunk]);
                fed += chunk;
                for block in slicer.drain_blocks() {
                    // only the final block of a completed stream may be short
                    assert!(block.len() == block_size || slicer.is_complete());
                    out.extend_from_slice(&block);
                }
            }
            assert_eq!(out, stream);
            assert_eq!(slicer.bytes_received(), total as u64);
            assert_eq!(slicer.remainder_len(), 0);
        }
    }
}
