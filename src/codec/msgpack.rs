//! MessagePack envelope serializer using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps (with field names)
//! rather than positional arrays, which keeps the encoding self-describing
//! and compatible with map-based MessagePack decoders on the other end of
//! the wire. `data` travels as a raw binary field via `serde_bytes`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Serializer;
use crate::error::{Result, TetherError};
use crate::payload::{Envelope, PayloadKind};

/// Wire shape of the MessagePack encoding.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    kind: u8,
    name: String,
    id: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    error: String,
}

/// Binary envelope serializer; install on both peers to replace the
/// textual default.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            kind: envelope.kind as u8,
            name: envelope.name.clone(),
            id: envelope.id,
            data: envelope.data.to_vec(),
            error: envelope.error.clone(),
        };
        // to_vec_named, not to_vec: struct-as-map keeps decoders agnostic of
        // field order.
        Ok(rmp_serde::to_vec_named(&wire)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        let wire: WireEnvelope = rmp_serde::from_slice(bytes)?;

        let kind = PayloadKind::from_u8(wire.kind)
            .ok_or_else(|| TetherError::Protocol(format!("unknown payload kind {}", wire.kind)))?;

        Ok(Envelope {
            kind,
            name: wire.name,
            id: wire.id,
            data: Bytes::from(wire.data),
            error: wire.error,
        })
    }
}
