//! Pluggable two-step handshake validation.
//!
//! The validator decides what the Handshake and Acknowledgement block
//! bodies look like and whether a received one is acceptable. Both peers
//! install the same implementation. All four operations are synchronous,
//! stateless, and perform no I/O; anything an implementation wants to
//! remember must travel in the bodies themselves (the default echoes a
//! nonce).

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Outcome of a verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The body is acceptable; continue the handshake.
    Success,
    /// The body is not acceptable; the connection is kicked or dropped.
    Failed,
}

/// Two-step handshake contract.
pub trait Validator: Send + Sync + 'static {
    /// Produce the initial offer. The optional payload is caller-supplied
    /// opaque detail (credentials, capabilities, anything).
    fn handshake(&self, payload: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Inspect a received initial offer.
    fn verify_handshake(&self, body: &[u8]) -> Verdict;

    /// Produce the reply to a verified offer, typically echoing a nonce.
    fn acknowledgement(&self, body: &[u8]) -> Result<Vec<u8>>;

    /// Inspect a received acknowledgement.
    fn verify_acknowledgement(&self, body: &[u8]) -> Verdict;
}

/// Protocol version the default validator speaks.
const HANDSHAKE_VERSION: u32 = 1;

/// Offer shape of the default validator.
#[derive(Serialize, Deserialize)]
struct Offer {
    version: u32,
    timestamp: u64,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// Acknowledgement shape of the default validator.
#[derive(Serialize, Deserialize)]
struct Reply {
    received: bool,
    nonce: String,
}

/// Default validator: versioned JSON offer with a random nonce echoed back
/// in the acknowledgement. Accepts any well-formed version-1 message.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl DefaultValidator {
    fn nonce() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }

    fn unix_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Validator for DefaultValidator {
    fn handshake(&self, payload: Option<&[u8]>) -> Result<Vec<u8>> {
        let offer = Offer {
            version: HANDSHAKE_VERSION,
            timestamp: Self::unix_millis(),
            nonce: Self::nonce(),
            payload: payload.map(|p| String::from_utf8_lossy(p).into_owned()),
        };
        Ok(serde_json::to_vec(&offer)?)
    }

    fn verify_handshake(&self, body: &[u8]) -> Verdict {
        match serde_json::from_slice::<Offer>(body) {
            Ok(offer) if offer.version == HANDSHAKE_VERSION && !offer.nonce.is_empty() => {
                Verdict::Success
            }
            _ => Verdict::Failed,
        }
    }

    fn acknowledgement(&self, body: &[u8]) -> Result<Vec<u8>> {
        // Echo the peer's nonce when the body carries one; an
        // acknowledgement of an acknowledgement echoes the same nonce again.
        let nonce = serde_json::from_slice::<Offer>(body)
            .map(|o| o.nonce)
            .or_else(|_| serde_json::from_slice::<Reply>(body).map(|r| r.nonce))
            .unwrap_or_default();

        let reply = Reply {
            received: true,
            nonce,
        };
        Ok(serde_json::to_vec(&reply)?)
    }

    fn verify_acknowledgement(&self, body: &[u8]) -> Verdict {
        match serde_json::from_slice::<Reply>(body) {
            Ok(reply) if reply.received => Verdict::Success,
            _ => Verdict::Failed,
        }
    }
}
