//! Wire block encoding and decoding.
//!
//! Implements the 4-byte head format:
//! ```text
//! ┌──────┬────────────────┐
//! │ Kind │ Body length    │
//! │ 1 B  │ 3 bytes, u24 BE│
//! └──────┴────────────────┘
//! ```
//!
//! The body length is a 24-bit big-endian unsigned integer, so a body can
//! carry at most 2^24 − 1 octets. A Heartbeat block has length 0.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TetherError};

/// Head size in bytes (fixed, exactly 4).
pub const HEAD_SIZE: usize = 4;

/// Maximum body length representable in the 24-bit length field.
pub const MAX_BODY_LEN: usize = 0xFF_FFFF;

/// Kind octet of a wire block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Initial handshake offer.
    Handshake = 0,
    /// Handshake acknowledgement (both rounds).
    Acknowledgement = 1,
    /// Liveness probe; always has an empty body.
    Heartbeat = 2,
    /// Application payload envelope.
    Data = 3,
    /// Forced disconnect; body carries the reason as decimal text.
    Kick = 4,
}

impl BlockKind {
    /// Map a wire octet to a kind, or `None` if it is not a defined variant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockKind::Handshake),
            1 => Some(BlockKind::Acknowledgement),
            2 => Some(BlockKind::Heartbeat),
            3 => Some(BlockKind::Data),
            4 => Some(BlockKind::Kick),
            _ => None,
        }
    }

    /// Check whether a wire octet names a defined variant.
    #[inline]
    pub fn is_valid(value: u8) -> bool {
        Self::from_u8(value).is_some()
    }
}

/// A complete wire block: kind plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block kind from the head octet.
    pub kind: BlockKind,
    /// Body bytes (zero-copy via `bytes::Bytes`), possibly empty.
    pub body: Bytes,
}

impl Block {
    /// Create a new block from kind and body.
    pub fn new(kind: BlockKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Create a bodyless block (Heartbeat and friends).
    pub fn empty(kind: BlockKind) -> Self {
        Self {
            kind,
            body: Bytes::new(),
        }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode the block into a contiguous frame (head + body).
    ///
    /// Body length is truncated to [`MAX_BODY_LEN`] never in practice;
    /// callers constructing bodies from user data must respect the limit,
    /// which [`encode_head`] asserts in debug builds.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEAD_SIZE + self.body.len());
        buf.put_slice(&encode_head(self.kind, self.body.len()));
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a complete frame back into a block.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the buffer is shorter than the head, carries an
    /// undefined kind octet, or its length field disagrees with the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEAD_SIZE {
            return Err(TetherError::Protocol(format!(
                "block shorter than head: {} bytes",
                buf.len()
            )));
        }

        let kind = BlockKind::from_u8(buf[0])
            .ok_or_else(|| TetherError::Protocol(format!("unknown block kind {}", buf[0])))?;
        let len = decode_len(&buf[1..HEAD_SIZE]);

        if buf.len() != HEAD_SIZE + len {
            return Err(TetherError::Protocol(format!(
                "length field says {} body bytes, buffer has {}",
                len,
                buf.len() - HEAD_SIZE
            )));
        }

        Ok(Self {
            kind,
            body: Bytes::copy_from_slice(&buf[HEAD_SIZE..]),
        })
    }
}

/// Encode a head: kind octet followed by the 24-bit big-endian body length.
pub fn encode_head(kind: BlockKind, body_len: usize) -> [u8; HEAD_SIZE] {
    debug_assert!(body_len <= MAX_BODY_LEN);
    [
        kind as u8,
        (body_len >> 16) as u8,
        (body_len >> 8) as u8,
        body_len as u8,
    ]
}

/// Decode the three length octets of a head (big endian).
#[inline]
pub fn decode_len(buf: &[u8]) -> usize {
    debug_assert!(buf.len() >= 3);
    ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | (buf[2] as usize)
}
