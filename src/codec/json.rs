//! JSON envelope serializer (default).
//!
//! Encodes the envelope as a textual object
//! `{kind: int, name: string, id: int, data: base64 string, error: string}`.
//! Opaque data bytes are base64-encoded so arbitrary binary payloads survive
//! the textual encoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Serializer;
use crate::error::{Result, TetherError};
use crate::payload::{Envelope, PayloadKind};

/// Wire shape of the JSON encoding.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    kind: u8,
    name: String,
    id: u64,
    data: String,
    error: String,
}

/// Textual envelope serializer; the default both ends agree on unless an
/// alternative is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            kind: envelope.kind as u8,
            name: envelope.name.clone(),
            id: envelope.id,
            data: BASE64.encode(&envelope.data),
            error: envelope.error.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;

        let kind = PayloadKind::from_u8(wire.kind)
            .ok_or_else(|| TetherError::Protocol(format!("unknown payload kind {}", wire.kind)))?;
        let data = BASE64
            .decode(&wire.data)
            .map_err(|e| TetherError::Protocol(format!("invalid base64 data: {e}")))?;

        Ok(Envelope {
            kind,
            name: wire.name,
            id: wire.id,
            data: Bytes::from(data),
            error: wire.error,
        })
    }
}
