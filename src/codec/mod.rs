//! Codec module - pluggable envelope serialization.
//!
//! A [`Serializer`] turns an [`Envelope`](crate::payload::Envelope) into
//! the bytes carried inside a Data block and back. Both peers must install
//! the same implementation; the serializer is injected at construction and
//! the core never assumes a particular encoding.
//!
//! - [`JsonSerializer`] - textual object with base64-encoded data (default)
//! - [`MsgPackSerializer`] - MessagePack using `rmp-serde` (to_vec_named
//!   for struct-as-map format)
//!
//! Serializers are synchronous and must not perform I/O.

mod json;
mod msgpack;

use crate::error::Result;
use crate::payload::Envelope;

pub use json::JsonSerializer;
pub use msgpack::MsgPackSerializer;

/// Pluggable wire encoding for payload envelopes.
pub trait Serializer: Send + Sync + 'static {
    /// Encode an envelope to bytes.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    /// Decode bytes back to an envelope.
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}
