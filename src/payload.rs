//! Payload envelope carried inside Data blocks.
//!
//! The envelope is the structured unit the commander speaks: a kind
//! (request, command, response), a target name, a correlation id, opaque
//! data bytes, and an error string for failed responses. Wire encoding is
//! delegated entirely to the injected [`Serializer`].

use bytes::Bytes;

use crate::codec::Serializer;
use crate::error::Result;

/// Kind discriminant of a payload envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// Invocation the peer must answer (or the sender times out locally).
    Request = 0,
    /// Fire-and-forget invocation; the peer never responds.
    Command = 1,
    /// Answer to an earlier Request, matched by id.
    Response = 2,
}

impl PayloadKind {
    /// Map a wire discriminant to a kind, or `None` for undefined values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadKind::Request),
            1 => Some(PayloadKind::Command),
            2 => Some(PayloadKind::Response),
            _ => None,
        }
    }
}

/// The contents of a Data-block body after deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope kind.
    pub kind: PayloadKind,
    /// Command/request name; a Response echoes the originating name.
    pub name: String,
    /// Correlation id: 0 for Command, unique per sender for Request, echoed
    /// back on Response.
    pub id: u64,
    /// Opaque payload bytes, possibly empty.
    pub data: Bytes,
    /// Empty for success; a non-empty string encodes a failed Response.
    pub error: String,
}

impl Envelope {
    /// Construct a Request envelope.
    pub fn request(name: impl Into<String>, id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Request,
            name: name.into(),
            id,
            data: data.into(),
            error: String::new(),
        }
    }

    /// Construct a Command envelope (id is always 0).
    pub fn command(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Command,
            name: name.into(),
            id: 0,
            data: data.into(),
            error: String::new(),
        }
    }

    /// Construct a successful Response echoing a request's name and id.
    pub fn response(name: impl Into<String>, id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Response,
            name: name.into(),
            id,
            data: data.into(),
            error: String::new(),
        }
    }

    /// Construct a failed Response in memory, without serialization.
    ///
    /// The timeout engine uses this to synthesize `error = "timeout"`
    /// responses that flow through the ordinary response path.
    pub fn failure(name: impl Into<String>, id: u64, error: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Response,
            name: name.into(),
            id,
            data: Bytes::new(),
            error: error.into(),
        }
    }

    /// Whether this envelope is well-formed: Request and Command require a
    /// non-empty name.
    pub fn check(&self) -> bool {
        match self.kind {
            PayloadKind::Request | PayloadKind::Command => !self.name.is_empty(),
            PayloadKind::Response => true,
        }
    }

    /// Whether this is a failed Response.
    #[inline]
    pub fn is_failure(&self) -> bool {
        !self.error.is_empty()
    }

    /// Serialize through the injected serializer.
    pub fn encode(&self, serializer: &dyn Serializer) -> Result<Vec<u8>> {
        serializer.encode(self)
    }

    /// Deserialize through the injected serializer.
    pub fn decode(serializer: &dyn Serializer, bytes: &[u8]) -> Result<Envelope> {
        serializer.decode(bytes)
    }
}
