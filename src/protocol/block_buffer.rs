//! Block buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a small state
//! machine for handling fragmented frames:
//! - `Head`: need at least 4 bytes
//! - `Body`: head parsed, need N more body bytes
//!
//! The kernel (or the WebSocket layer) may chunk the byte stream anywhere,
//! including mid-head; `push` absorbs arbitrary chunking and yields whole
//! blocks in wire order. An undefined kind octet is a framing error: the
//! buffered remainder is discarded with a warning and parsing resumes at the
//! next pushed chunk. Framing errors never close the connection.

use bytes::{Bytes, BytesMut};

use super::block::{decode_len, Block, BlockKind, HEAD_SIZE};

/// State machine for block parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete 4-byte head.
    Head,
    /// Head parsed, waiting for body bytes.
    Body { kind: BlockKind, remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete blocks.
pub struct BlockBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl BlockBuffer {
    /// Create a new block buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Head,
        }
    }

    /// Push data into the buffer and extract all complete blocks.
    ///
    /// Returns the blocks completed by this chunk (possibly none). Partial
    /// data is kept internally for the next push. A chunk may complete
    /// several blocks at once.
    pub fn push(&mut self, data: &[u8]) -> Vec<Block> {
        self.buffer.extend_from_slice(data);

        let mut blocks = Vec::new();
        while let Some(block) = self.try_extract_one() {
            blocks.push(block);
        }
        blocks
    }

    /// Try to extract a single block from the buffer.
    ///
    /// Returns `None` when more data is needed, or after a framing error
    /// discarded the buffered remainder.
    fn try_extract_one(&mut self) -> Option<Block> {
        match &self.state {
            State::Head => {
                if self.buffer.len() < HEAD_SIZE {
                    return None;
                }

                let kind_octet = self.buffer[0];
                let Some(kind) = BlockKind::from_u8(kind_octet) else {
                    tracing::warn!(kind = kind_octet, "invalid block kind, dropping chunk");
                    self.buffer.clear();
                    return None;
                };
                let len = decode_len(&self.buffer[1..HEAD_SIZE]);

                let _ = self.buffer.split_to(HEAD_SIZE);

                if len == 0 {
                    return Some(Block::new(kind, Bytes::new()));
                }

                self.state = State::Body {
                    kind,
                    remaining: len,
                };
                self.try_extract_one()
            }

            State::Body { kind, remaining } => {
                let (kind, remaining) = (*kind, *remaining);

                if self.buffer.len() < remaining {
                    return None;
                }

                let body = self.buffer.split_to(remaining).freeze();
                self.state = State::Head;
                Some(Block::new(kind, body))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Head;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::Head => "Head",
            State::Body { .. } => "Body",
        }
    }
}

impl Default for BlockBuffer {
    fn default() -> Self {
        Self::new()
    }
}
