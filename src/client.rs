//! Client - one connection plus its commander.
//!
//! On the outbound side, [`ClientBuilder::connect`] dials the configured
//! transport and spawns a Bot-role engine that sends the handshake offer
//! immediately. On the server side, every accepted socket is wrapped in the
//! same `Client` type with a Service-role engine.
//!
//! The client is a cheap clone; dropping it does not close the connection.
//! Use [`disconnect`](Client::disconnect) or [`destroy`](Client::destroy)
//! to end it, and [`closed`](Client::closed) to await the single
//! disconnect notification.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::codec::Serializer;
use crate::commander::{create_engine, Commander, DisconnectReason, EngineOptions, Role};
use crate::config::Config;
use crate::error::{Result, TetherError};
use crate::payload::Envelope;
use crate::transport;
use crate::validator::Validator;

/// Builder for an outbound (bot) connection.
pub struct ClientBuilder {
    config: Config,
    serializer: Option<Arc<dyn Serializer>>,
    validator: Option<Arc<dyn Validator>>,
    handshake_payload: Option<Vec<u8>>,
}

impl ClientBuilder {
    /// Start from an explicit configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            serializer: None,
            validator: None,
            handshake_payload: None,
        }
    }

    /// Start from `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Config::from_env()?))
    }

    /// Replace the default payload serializer. Both peers must agree.
    pub fn serializer(mut self, serializer: impl Serializer) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Replace the default handshake validator. Both peers must agree.
    pub fn validator(mut self, validator: impl Validator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Opaque detail carried inside the handshake offer.
    pub fn handshake_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.handshake_payload = Some(payload.into());
        self
    }

    /// Dial the configured transport and start the connection engine. The
    /// handshake offer goes out immediately; await
    /// [`Client::ready`] to know it completed.
    pub async fn connect(self) -> Result<Client> {
        self.config.validate()?;

        let (transport, id) = transport::connect(&self.config).await?;
        tracing::debug!(conn = %id, host = %self.config.host, port = self.config.port, "connected");

        let mut options = EngineOptions::new(Role::Bot, &self.config);
        if let Some(serializer) = self.serializer {
            options.serializer = serializer;
        }
        if let Some(validator) = self.validator {
            options.validator = validator;
        }
        options.handshake_payload = self.handshake_payload;

        let (engine, commander, ready, closed) = create_engine(transport, id.clone(), options);
        tokio::spawn(engine.run());

        Ok(Client::from_parts(commander, ready, closed, &id))
    }
}

/// Handle to one live connection, exposing the full commander API plus
/// lifecycle waits.
#[derive(Clone)]
pub struct Client {
    commander: Commander,
    ready: watch::Receiver<bool>,
    closed: watch::Receiver<Option<DisconnectReason>>,
    id: Arc<str>,
}

impl Client {
    pub(crate) fn from_parts(
        commander: Commander,
        ready: watch::Receiver<bool>,
        closed: watch::Receiver<Option<DisconnectReason>>,
        id: &str,
    ) -> Self {
        Self {
            commander,
            ready,
            closed,
            id: Arc::from(id),
        }
    }

    /// Connection identifier used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A commander handle detached from this client.
    pub fn commander(&self) -> Commander {
        self.commander.clone()
    }

    /// Wait for the handshake to complete.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` when the connection dies first.
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| TetherError::ConnectionClosed)
    }

    /// Wait for the connection to close and return the recorded reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut closed = self.closed.clone();
        let result = match closed.wait_for(|c| c.is_some()).await {
            Ok(reason) => reason.unwrap_or(DisconnectReason::Unknown),
            Err(_) => DisconnectReason::Unknown,
        };
        result
    }

    /// Whether the handshake completed.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Whether the connection reached Closed.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Send a fire-and-forget command.
    pub fn command(&self, name: &str, data: impl Into<Bytes>) {
        self.commander.command(name, data);
    }

    /// Send a request with a completion callback; returns the request id.
    pub fn request(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        callback: impl FnOnce(Envelope) + Send + 'static,
    ) -> u64 {
        self.commander.request(name, data, callback)
    }

    /// Send a request and await the response envelope.
    pub async fn fetch(&self, name: &str, data: impl Into<Bytes>) -> Result<Envelope> {
        self.commander.fetch(name, data).await
    }

    /// Answer an inbound request.
    pub fn response(&self, originating: &Envelope, data: impl Into<Bytes>) {
        self.commander.response(originating, data);
    }

    /// Answer an inbound request with a failure.
    pub fn error(&self, originating: &Envelope, message: &str, data: impl Into<Bytes>) {
        self.commander.error(originating, message, data);
    }

    /// Abandon a pending request locally.
    pub fn cancel(&self, id: u64) {
        self.commander.cancel(id);
    }

    /// Subscribe to inbound commands; returns a subscription id.
    pub fn on(&self, name: &str, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> u64 {
        self.commander.on(name, callback)
    }

    /// Remove one subscription, or all for the name.
    pub fn off(&self, name: &str, subscription: Option<u64>) {
        self.commander.off(name, subscription);
    }

    /// Install the single handler for inbound requests with this name.
    pub fn on_request(
        &self,
        name: &str,
        callback: impl Fn(Commander, Envelope) + Send + Sync + 'static,
    ) {
        self.commander.on_request(name, callback);
    }

    /// Remove the request handler for this name.
    pub fn off_request(&self, name: &str) {
        self.commander.off_request(name);
    }

    /// Send a Kick block, then disconnect.
    pub fn kick(&self, reason: DisconnectReason) {
        self.commander.kick(reason);
    }

    /// Gracefully close the connection.
    pub fn disconnect(&self) {
        self.commander.disconnect();
    }

    /// Hard-terminate the connection.
    pub fn destroy(&self) {
        self.commander.destroy();
    }
}
