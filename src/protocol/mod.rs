//! Protocol module - wire blocks, framing, and the lifecycle state machine.
//!
//! - 4-byte head encoding/decoding ([`Block`], [`BlockKind`])
//! - [`BlockBuffer`] for reassembling blocks from arbitrary chunking
//! - [`Protocol`] gating inbound kinds per lifecycle state

mod block;
mod block_buffer;
mod state;

pub use block::{decode_len, encode_head, Block, BlockKind, HEAD_SIZE, MAX_BODY_LEN};
pub use block_buffer::BlockBuffer;
pub use state::{Protocol, ProtocolState};
