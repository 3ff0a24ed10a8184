//! Commander - the top of the per-connection engine.
//!
//! The commander multiplexes three concerns over one protocol instance: the
//! handshake drive, the command/request engine, and the timeout/liveness
//! policy. It is split into a cheap [`Commander`] handle that user code and
//! handlers clone freely, and an engine task that owns all connection state
//! and serializes the five event sources (inbound blocks, pulse ticks,
//! timeout scans, user ops, transport close) in one `select!` loop.
//!
//! The handle submits operations over an unbounded channel; every operation
//! is a silent no-op once the connection reached Closed.

mod engine;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TetherError};
use crate::payload::Envelope;

pub(crate) use engine::{create_engine, Engine, EngineOptions};

/// Which side of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting side: waits for the handshake, pongs heartbeats, kicks on
    /// silence, dispatches to the registered task table.
    Service,
    /// Outbound side: initiates the handshake, proactively heartbeats on
    /// silence, dispatches to subscriptions.
    Bot,
}

/// Why a connection ended. Travels in Kick bodies as decimal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    /// Clean shutdown; the default when nothing else was recorded.
    #[default]
    Normal,
    /// Service-side pulse expired: the peer went silent.
    Timeout,
    /// Handshake verification failed.
    Handshake,
    /// The server is stopping.
    ServerDown,
    /// Anything unrecognized.
    Unknown,
}

impl DisconnectReason {
    /// Wire discriminant.
    pub fn as_u8(self) -> u8 {
        match self {
            DisconnectReason::Normal => 0,
            DisconnectReason::Timeout => 1,
            DisconnectReason::Handshake => 2,
            DisconnectReason::ServerDown => 3,
            DisconnectReason::Unknown => 4,
        }
    }

    /// Map a discriminant back; unrecognized values collapse to Unknown.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DisconnectReason::Normal,
            1 => DisconnectReason::Timeout,
            2 => DisconnectReason::Handshake,
            3 => DisconnectReason::ServerDown,
            _ => DisconnectReason::Unknown,
        }
    }

    /// Encode as a Kick block body: the decimal textual representation.
    pub fn kick_body(self) -> Bytes {
        Bytes::from(self.as_u8().to_string())
    }

    /// Parse a Kick block body back to a reason; malformed bodies collapse
    /// to Unknown.
    pub fn parse_kick_body(body: &[u8]) -> Self {
        std::str::from_utf8(body)
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .map(Self::from_u8)
            .unwrap_or(DisconnectReason::Unknown)
    }
}

/// Callback invoked for every matching inbound Command.
pub type CommandCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handler for inbound Requests the peer expects answered; it is expected
/// to call [`Commander::response`] or [`Commander::error`].
pub type RequestCallback = Arc<dyn Fn(Commander, Envelope) + Send + Sync>;

/// One-shot callback completing an outbound request.
pub type ResponseCallback = Box<dyn FnOnce(Envelope) + Send>;

/// Completion sink of a pending outbound request.
pub(crate) enum ResponseSink {
    Callback(ResponseCallback),
    Future(oneshot::Sender<Envelope>),
}

impl ResponseSink {
    pub(crate) fn deliver(self, envelope: Envelope) {
        match self {
            ResponseSink::Callback(callback) => callback(envelope),
            ResponseSink::Future(tx) => {
                let _ = tx.send(envelope);
            }
        }
    }
}

/// Operations the handle submits to the engine.
pub(crate) enum Op {
    Command {
        name: String,
        data: Bytes,
    },
    Request {
        name: String,
        id: u64,
        data: Bytes,
        sink: ResponseSink,
    },
    Respond {
        name: String,
        id: u64,
        data: Bytes,
        error: String,
    },
    Cancel {
        id: u64,
    },
    Subscribe {
        name: String,
        id: u64,
        callback: CommandCallback,
    },
    Unsubscribe {
        name: String,
        id: Option<u64>,
    },
    SetRequestHandler {
        name: String,
        callback: RequestCallback,
    },
    ClearRequestHandler {
        name: String,
    },
    Kick {
        reason: DisconnectReason,
    },
    Disconnect,
    Destroy,
}

/// Callbacks into the owning client/server, installed at construction.
///
/// `on_connect` has no slot here: it fires from the accept path before the
/// engine exists.
pub trait ConnectionHooks: Send + Sync + 'static {
    /// The handshake completed; the connection reached Work.
    fn on_ready(&self, _commander: &Commander) {}

    /// The connection reached Closed. Fired exactly once.
    fn on_disconnect(&self, _commander: &Commander, _reason: DisconnectReason) {}
}

/// No-op hooks for connections that only use the watch-channel state.
pub(crate) struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

/// Service-side binding to the statically registered task table. Inbound
/// Commands and Requests consult it by name; `dispatch` reports whether a
/// task with that name exists.
pub trait InboundDispatch: Send + Sync + 'static {
    /// Run the named task, if registered.
    fn dispatch(&self, commander: Commander, envelope: Envelope) -> bool;
}

/// Cheap, cloneable handle to one connection's engine.
#[derive(Clone)]
pub struct Commander {
    ops: mpsc::UnboundedSender<Op>,
    next_request_id: Arc<AtomicU64>,
    next_subscription_id: Arc<AtomicU64>,
    id: Arc<str>,
}

impl Commander {
    pub(crate) fn new(ops: mpsc::UnboundedSender<Op>, id: &str) -> Self {
        Self {
            ops,
            next_request_id: Arc::new(AtomicU64::new(0)),
            next_subscription_id: Arc::new(AtomicU64::new(0)),
            id: Arc::from(id),
        }
    }

    /// Connection identifier used in logs.
    pub fn connection_id(&self) -> &str {
        &self.id
    }

    fn submit(&self, op: Op) {
        // A dead engine means the connection is closed; every operation is
        // a no-op then.
        let _ = self.ops.send(op);
    }

    /// Send a fire-and-forget command.
    pub fn command(&self, name: &str, data: impl Into<Bytes>) {
        self.submit(Op::Command {
            name: name.to_string(),
            data: data.into(),
        });
    }

    /// Send a request; the callback fires exactly once with the matching
    /// response or a synthesized timeout failure. Returns the request id,
    /// usable with [`cancel`](Self::cancel).
    pub fn request(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        callback: impl FnOnce(Envelope) + Send + 'static,
    ) -> u64 {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.submit(Op::Request {
            name: name.to_string(),
            id,
            data: data.into(),
            sink: ResponseSink::Callback(Box::new(callback)),
        });
        id
    }

    /// Send a request and await the response envelope.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` when the connection dies before an answer or
    /// timeout arrives. A peer failure or timeout still resolves `Ok`: the
    /// envelope carries the error string.
    pub async fn fetch(&self, name: &str, data: impl Into<Bytes>) -> Result<Envelope> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.submit(Op::Request {
            name: name.to_string(),
            id,
            data: data.into(),
            sink: ResponseSink::Future(tx),
        });
        rx.await.map_err(|_| TetherError::ConnectionClosed)
    }

    /// Answer an inbound request, echoing its name and id.
    pub fn response(&self, originating: &Envelope, data: impl Into<Bytes>) {
        self.submit(Op::Respond {
            name: originating.name.clone(),
            id: originating.id,
            data: data.into(),
            error: String::new(),
        });
    }

    /// Answer an inbound request with a failure.
    pub fn error(&self, originating: &Envelope, message: &str, data: impl Into<Bytes>) {
        self.submit(Op::Respond {
            name: originating.name.clone(),
            id: originating.id,
            data: data.into(),
            error: message.to_string(),
        });
    }

    /// Abandon a pending request locally. Nothing is sent on the wire; a
    /// late response will be warned-as-unknown.
    pub fn cancel(&self, id: u64) {
        self.submit(Op::Cancel { id });
    }

    /// Subscribe to inbound commands with the given name. Callbacks fan out
    /// in registration order. Returns a subscription id for [`off`](Self::off).
    pub fn on(&self, name: &str, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.submit(Op::Subscribe {
            name: name.to_string(),
            id,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove one subscription, or all subscriptions for the name.
    pub fn off(&self, name: &str, subscription: Option<u64>) {
        self.submit(Op::Unsubscribe {
            name: name.to_string(),
            id: subscription,
        });
    }

    /// Install the single handler for inbound requests with this name.
    /// Duplicate registration is rejected with a log warning.
    pub fn on_request(
        &self,
        name: &str,
        callback: impl Fn(Commander, Envelope) + Send + Sync + 'static,
    ) {
        self.submit(Op::SetRequestHandler {
            name: name.to_string(),
            callback: Arc::new(callback),
        });
    }

    /// Remove the request handler for this name.
    pub fn off_request(&self, name: &str) {
        self.submit(Op::ClearRequestHandler {
            name: name.to_string(),
        });
    }

    /// Send a Kick block with the reason, then disconnect.
    pub fn kick(&self, reason: DisconnectReason) {
        self.submit(Op::Kick { reason });
    }

    /// Gracefully close the connection.
    pub fn disconnect(&self) {
        self.submit(Op::Disconnect);
    }

    /// Hard-terminate the connection.
    pub fn destroy(&self) {
        self.submit(Op::Destroy);
    }
}
