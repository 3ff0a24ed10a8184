//! Per-connection engine task.
//!
//! Owns every piece of connection state - protocol, pulse, pending
//! requests, subscription tables - and serializes the five event sources on
//! one `select!` loop:
//!
//! 1. inbound blocks from the protocol gate,
//! 2. pulse ticks,
//! 3. the request-timeout scan,
//! 4. operations submitted through [`Commander`] handles,
//! 5. transport closure (surfaces as the inbound stream ending).
//!
//! Inbound Data dispatch is therefore FIFO with respect to wire order, and
//! outbound writes leave in program order. Nothing here locks; the engine
//! is the per-connection single-threaded context.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{
    Commander, CommandCallback, ConnectionHooks, DisconnectReason, InboundDispatch, NoopHooks, Op,
    RequestCallback, ResponseSink, Role,
};
use crate::codec::{JsonSerializer, Serializer};
use crate::config::Config;
use crate::payload::{Envelope, PayloadKind};
use crate::protocol::{Block, BlockKind, Protocol, MAX_BODY_LEN};
use crate::pulse::Pulse;
use crate::transport::Transport;
use crate::validator::{DefaultValidator, Validator, Verdict};

/// A pending outbound request awaiting its response or timeout.
struct PendingRequest {
    name: String,
    sent_at: Instant,
    sink: ResponseSink,
}

/// Everything an engine needs besides its transport.
pub(crate) struct EngineOptions {
    pub role: Role,
    pub serializer: Arc<dyn Serializer>,
    pub validator: Arc<dyn Validator>,
    pub dispatch: Option<Arc<dyn InboundDispatch>>,
    pub hooks: Arc<dyn ConnectionHooks>,
    pub handshake_payload: Option<Vec<u8>>,
    pub pulse_interval: Duration,
    pub pulse_limit: u32,
    pub request_timeout: Duration,
}

impl EngineOptions {
    /// Role-aware defaults from a config: the bot pulse fires on every
    /// silent tick (limit 0), the service pulse tolerates the configured
    /// number of silent ticks.
    pub fn new(role: Role, config: &Config) -> Self {
        Self {
            role,
            serializer: Arc::new(JsonSerializer),
            validator: Arc::new(DefaultValidator),
            dispatch: None,
            hooks: Arc::new(NoopHooks),
            handshake_payload: None,
            pulse_interval: config.pulse_interval,
            pulse_limit: match role {
                Role::Service => config.pulse_limit,
                Role::Bot => 0,
            },
            request_timeout: config.request_timeout,
        }
    }
}

/// The engine state machine; consumed by [`Engine::run`].
pub(crate) struct Engine {
    role: Role,
    protocol: Protocol,
    pulse: Pulse,
    serializer: Arc<dyn Serializer>,
    validator: Arc<dyn Validator>,
    dispatch: Option<Arc<dyn InboundDispatch>>,
    hooks: Arc<dyn ConnectionHooks>,
    handle: Commander,
    ops: mpsc::UnboundedReceiver<Op>,
    pending: HashMap<u64, PendingRequest>,
    subscriptions: HashMap<String, Vec<(u64, CommandCallback)>>,
    request_handlers: HashMap<String, RequestCallback>,
    request_timeout: Duration,
    handshake_payload: Option<Vec<u8>>,
    reason: DisconnectReason,
    ready_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<Option<DisconnectReason>>,
}

/// Build an engine over a connected transport. The caller decides when to
/// spawn [`Engine::run`], which lets a server register the connection
/// before the first block can arrive.
pub(crate) fn create_engine(
    transport: Transport,
    id: String,
    options: EngineOptions,
) -> (
    Engine,
    Commander,
    watch::Receiver<bool>,
    watch::Receiver<Option<DisconnectReason>>,
) {
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let handle = Commander::new(ops_tx, &id);
    let (ready_tx, ready_rx) = watch::channel(false);
    let (closed_tx, closed_rx) = watch::channel(None);

    let engine = Engine {
        role: options.role,
        protocol: Protocol::new(transport, id.as_str()),
        pulse: Pulse::new(options.pulse_interval, options.pulse_limit),
        serializer: options.serializer,
        validator: options.validator,
        dispatch: options.dispatch,
        hooks: options.hooks,
        handle: handle.clone(),
        ops: ops_rx,
        pending: HashMap::new(),
        subscriptions: HashMap::new(),
        request_handlers: HashMap::new(),
        request_timeout: options.request_timeout,
        handshake_payload: options.handshake_payload,
        reason: DisconnectReason::Normal,
        ready_tx,
        closed_tx,
    };

    (engine, handle, ready_rx, closed_rx)
}

impl Engine {
    /// Drive the connection until it closes, then tear everything down.
    pub(crate) async fn run(mut self) {
        tracing::debug!(conn = %self.protocol.id(), role = ?self.role, "connection engine started");

        if self.role == Role::Bot {
            match self.validator.handshake(self.handshake_payload.as_deref()) {
                Ok(offer) => self.protocol.handshake(offer).await,
                Err(e) => {
                    tracing::error!(
                        conn = %self.protocol.id(),
                        "failed to build handshake offer: {}",
                        e
                    );
                    self.reason = DisconnectReason::Handshake;
                    self.protocol.disconnect();
                    self.clear();
                    return;
                }
            }
        }

        let scan_period = self.request_timeout.min(Duration::from_secs(1));
        let mut scan = time::interval_at(Instant::now() + scan_period, scan_period);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                block = self.protocol.recv() => match block {
                    Some(block) => self.on_block(block).await,
                    None => ControlFlow::Break(()),
                },
                op = self.ops.recv() => match op {
                    Some(op) => self.on_op(op).await,
                    // Unreachable while the engine holds its own handle.
                    None => ControlFlow::Continue(()),
                },
                fired = self.pulse.tick() => match fired {
                    true => self.on_pulse().await,
                    false => ControlFlow::Continue(()),
                },
                _ = scan.tick() => {
                    self.scan_pending();
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        self.clear();
    }

    /// Inbound dispatch for a gate-admitted block.
    async fn on_block(&mut self, block: Block) -> ControlFlow<()> {
        match block.kind {
            BlockKind::Handshake => self.on_handshake(block).await,
            BlockKind::Acknowledgement => self.on_acknowledgement(block).await,
            BlockKind::Heartbeat => {
                self.pulse.reset();
                if self.role == Role::Service {
                    self.protocol.heartbeat().await;
                }
                ControlFlow::Continue(())
            }
            BlockKind::Kick => {
                self.pulse.reset();
                self.reason = DisconnectReason::parse_kick_body(&block.body);
                tracing::debug!(
                    conn = %self.protocol.id(),
                    reason = ?self.reason,
                    "kicked by peer"
                );
                ControlFlow::Continue(())
            }
            BlockKind::Data => self.on_data(block).await,
        }
    }

    async fn on_handshake(&mut self, block: Block) -> ControlFlow<()> {
        self.pulse.reset();

        match self.validator.verify_handshake(&block.body) {
            Verdict::Success => match self.validator.acknowledgement(&block.body) {
                Ok(ack) => {
                    self.protocol.acknowledge(ack).await;
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    tracing::error!(
                        conn = %self.protocol.id(),
                        "failed to build acknowledgement: {}",
                        e
                    );
                    self.fail_handshake().await
                }
            },
            Verdict::Failed => {
                tracing::warn!(conn = %self.protocol.id(), "handshake rejected, kicking peer");
                self.fail_handshake().await
            }
        }
    }

    /// Kick the peer with reason Handshake and end the connection.
    async fn fail_handshake(&mut self) -> ControlFlow<()> {
        self.reason = DisconnectReason::Handshake;
        self.protocol
            .kick(DisconnectReason::Handshake.kick_body())
            .await;
        self.protocol.disconnect();
        ControlFlow::Break(())
    }

    async fn on_acknowledgement(&mut self, block: Block) -> ControlFlow<()> {
        self.pulse.reset();

        if self.role == Role::Bot {
            match self.validator.verify_acknowledgement(&block.body) {
                Verdict::Failed => {
                    tracing::warn!(conn = %self.protocol.id(), "acknowledgement rejected");
                    self.reason = DisconnectReason::Handshake;
                    self.protocol.disconnect();
                    return ControlFlow::Break(());
                }
                Verdict::Success => match self.validator.acknowledgement(&block.body) {
                    Ok(ack) => self.protocol.acknowledge(ack).await,
                    Err(e) => {
                        tracing::error!(
                            conn = %self.protocol.id(),
                            "failed to build acknowledgement: {}",
                            e
                        );
                        self.reason = DisconnectReason::Handshake;
                        self.protocol.disconnect();
                        return ControlFlow::Break(());
                    }
                },
            }
        }

        let _ = self.ready_tx.send(true);
        self.hooks.on_ready(&self.handle);
        ControlFlow::Continue(())
    }

    async fn on_data(&mut self, block: Block) -> ControlFlow<()> {
        let envelope = match Envelope::decode(self.serializer.as_ref(), &block.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(conn = %self.protocol.id(), "undecodable data block: {}", e);
                return ControlFlow::Continue(());
            }
        };
        if !envelope.check() {
            tracing::warn!(conn = %self.protocol.id(), "malformed envelope discarded");
            return ControlFlow::Continue(());
        }

        self.pulse.reset();
        if self.role == Role::Bot {
            // Inbound traffic proves the link is up; answer with a
            // keepalive so the service-side pulse stays quiet too.
            self.protocol.heartbeat().await;
        }

        match envelope.kind {
            PayloadKind::Command => self.on_command(envelope),
            PayloadKind::Request => self.on_request(envelope),
            PayloadKind::Response => self.on_response(envelope),
        }
        ControlFlow::Continue(())
    }

    fn on_command(&mut self, envelope: Envelope) {
        match self.role {
            Role::Service => {
                let name = envelope.name.clone();
                let handled = self
                    .dispatch
                    .as_ref()
                    .map(|d| d.dispatch(self.handle.clone(), envelope))
                    .unwrap_or(false);
                if !handled {
                    tracing::warn!(conn = %self.protocol.id(), command = %name, "unknown command");
                }
            }
            Role::Bot => match self.subscriptions.get(&envelope.name) {
                Some(callbacks) if !callbacks.is_empty() => {
                    for (_, callback) in callbacks {
                        callback(&envelope);
                    }
                }
                _ => {
                    tracing::warn!(
                        conn = %self.protocol.id(),
                        command = %envelope.name,
                        "no subscription for command"
                    );
                }
            },
        }
    }

    fn on_request(&mut self, envelope: Envelope) {
        match self.role {
            Role::Service => {
                let name = envelope.name.clone();
                let handled = self
                    .dispatch
                    .as_ref()
                    .map(|d| d.dispatch(self.handle.clone(), envelope))
                    .unwrap_or(false);
                if !handled {
                    // No response is sent; the peer's own timeout fires.
                    tracing::warn!(conn = %self.protocol.id(), request = %name, "unknown request");
                }
            }
            Role::Bot => match self.request_handlers.get(&envelope.name) {
                Some(callback) => callback(self.handle.clone(), envelope),
                None => {
                    tracing::warn!(
                        conn = %self.protocol.id(),
                        request = %envelope.name,
                        "no handler for request"
                    );
                }
            },
        }
    }

    fn on_response(&mut self, envelope: Envelope) {
        match self.pending.remove(&envelope.id) {
            Some(record) => record.sink.deliver(envelope),
            None => {
                tracing::warn!(
                    conn = %self.protocol.id(),
                    id = envelope.id,
                    "response for unknown request id"
                );
            }
        }
    }

    /// The pulse counter ran past its limit.
    async fn on_pulse(&mut self) -> ControlFlow<()> {
        match self.role {
            Role::Service => {
                tracing::warn!(conn = %self.protocol.id(), "peer silent past pulse limit, kicking");
                self.reason = DisconnectReason::Timeout;
                self.protocol
                    .kick(DisconnectReason::Timeout.kick_body())
                    .await;
                self.protocol.disconnect();
                ControlFlow::Break(())
            }
            Role::Bot => {
                self.protocol.heartbeat().await;
                ControlFlow::Continue(())
            }
        }
    }

    /// Expire pending requests past the timeout by synthesizing failing
    /// responses through the ordinary response path.
    fn scan_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let now = Instant::now();
        let expired: Vec<(u64, String)> = self
            .pending
            .iter()
            .filter(|(_, record)| now.duration_since(record.sent_at) > self.request_timeout)
            .map(|(id, record)| (*id, record.name.clone()))
            .collect();

        for (id, name) in expired {
            tracing::warn!(conn = %self.protocol.id(), request = %name, id, "request timed out");
            self.on_response(Envelope::failure(name, id, "timeout"));
        }
    }

    async fn on_op(&mut self, op: Op) -> ControlFlow<()> {
        match op {
            Op::Command { name, data } => {
                self.send_envelope(Envelope::command(name, data)).await;
            }
            Op::Request {
                name,
                id,
                data,
                sink,
            } => {
                if self.protocol.is_closed() {
                    // Dropping the sink resolves a fetch with
                    // ConnectionClosed; a plain callback is abandoned.
                    return ControlFlow::Continue(());
                }
                self.pending.insert(
                    id,
                    PendingRequest {
                        name: name.clone(),
                        sent_at: Instant::now(),
                        sink,
                    },
                );
                self.send_envelope(Envelope::request(name, id, data)).await;
            }
            Op::Respond {
                name,
                id,
                data,
                error,
            } => {
                let mut envelope = Envelope::response(name, id, data);
                envelope.error = error;
                self.send_envelope(envelope).await;
            }
            Op::Cancel { id } => {
                self.pending.remove(&id);
            }
            Op::Subscribe { name, id, callback } => {
                self.subscriptions
                    .entry(name)
                    .or_default()
                    .push((id, callback));
            }
            Op::Unsubscribe { name, id } => match id {
                Some(subscription) => {
                    if let Some(callbacks) = self.subscriptions.get_mut(&name) {
                        callbacks.retain(|(i, _)| *i != subscription);
                        if callbacks.is_empty() {
                            self.subscriptions.remove(&name);
                        }
                    }
                }
                None => {
                    self.subscriptions.remove(&name);
                }
            },
            Op::SetRequestHandler { name, callback } => match self.request_handlers.entry(name) {
                Entry::Occupied(entry) => {
                    tracing::warn!(
                        conn = %self.protocol.id(),
                        request = %entry.key(),
                        "request handler already registered, keeping existing"
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(callback);
                }
            },
            Op::ClearRequestHandler { name } => {
                self.request_handlers.remove(&name);
            }
            Op::Kick { reason } => {
                if self.protocol.is_closed() {
                    return ControlFlow::Continue(());
                }
                self.reason = reason;
                self.protocol.kick(reason.kick_body()).await;
                self.protocol.disconnect();
                return ControlFlow::Break(());
            }
            Op::Disconnect => {
                self.protocol.disconnect();
                return ControlFlow::Break(());
            }
            Op::Destroy => {
                self.protocol.destroy();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn send_envelope(&mut self, envelope: Envelope) {
        if self.protocol.is_closed() {
            return;
        }
        match envelope.encode(self.serializer.as_ref()) {
            Ok(bytes) if bytes.len() > MAX_BODY_LEN => {
                tracing::error!(
                    conn = %self.protocol.id(),
                    size = bytes.len(),
                    "envelope exceeds maximum block body, dropped"
                );
            }
            Ok(bytes) => self.protocol.send(bytes).await,
            Err(e) => {
                tracing::error!(conn = %self.protocol.id(), "failed to encode envelope: {}", e);
            }
        }
    }

    /// Tear down every resource this connection owns and surface the single
    /// disconnect notification.
    fn clear(&mut self) {
        self.pulse.clear();
        self.pending.clear();
        self.subscriptions.clear();
        self.request_handlers.clear();
        self.protocol.destroy();

        let _ = self.closed_tx.send(Some(self.reason));
        self.hooks.on_disconnect(&self.handle, self.reason);

        tracing::debug!(
            conn = %self.protocol.id(),
            reason = ?self.reason,
            "connection engine stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{test_transport, OutboundBlock};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct Harness {
        commander: Commander,
        wire_in: mpsc::Sender<Block>,
        wire_out: mpsc::Receiver<OutboundBlock>,
        ready: watch::Receiver<bool>,
        closed: watch::Receiver<Option<DisconnectReason>>,
    }

    impl Harness {
        fn spawn(options: EngineOptions) -> Self {
            let (transport, wire_in, wire_out) = test_transport();
            let (engine, commander, ready, closed) =
                create_engine(transport, "engtest0000".to_string(), options);
            tokio::spawn(engine.run());
            Self {
                commander,
                wire_in,
                wire_out,
                ready,
                closed,
            }
        }

        /// Next outbound block of the wanted kind, skipping heartbeats and
        /// anything else.
        async fn next_out(&mut self, kind: BlockKind) -> OutboundBlock {
            timeout(Duration::from_secs(2), async {
                loop {
                    let block = self.wire_out.recv().await.expect("wire closed");
                    if block.head[0] == kind as u8 {
                        return block;
                    }
                }
            })
            .await
            .expect("timed out waiting for block")
        }

        async fn push(&self, block: Block) {
            self.wire_in.send(block).await.expect("engine gone");
        }

        /// Drive the bot handshake to completion against a fake service.
        async fn complete_bot_handshake(&mut self) {
            let offer = self.next_out(BlockKind::Handshake).await;
            let ack = DefaultValidator.acknowledgement(&offer.body).unwrap();
            self.push(Block::new(BlockKind::Acknowledgement, ack)).await;
            self.next_out(BlockKind::Acknowledgement).await;
            self.ready.wait_for(|r| *r).await.unwrap();
        }

        async fn push_envelope(&self, envelope: &Envelope) {
            let bytes = JsonSerializer.encode(envelope).unwrap();
            self.push(Block::new(BlockKind::Data, bytes)).await;
        }

        fn decode_out(&self, block: &OutboundBlock) -> Envelope {
            JsonSerializer.decode(&block.body).unwrap()
        }

        async fn wait_closed(&mut self) -> DisconnectReason {
            timeout(Duration::from_secs(2), self.closed.wait_for(|c| c.is_some()))
                .await
                .expect("timed out waiting for close")
                .unwrap()
                .unwrap()
        }
    }

    fn bot_options() -> EngineOptions {
        let mut config = Config::default();
        // Keep the keepalive quiet during short tests.
        config.pulse_interval = Duration::from_secs(30);
        EngineOptions::new(Role::Bot, &config)
    }

    #[tokio::test]
    async fn test_bot_handshake_reaches_ready() {
        let mut h = Harness::spawn(bot_options());

        let offer = h.next_out(BlockKind::Handshake).await;
        assert_eq!(
            DefaultValidator.verify_handshake(&offer.body),
            Verdict::Success
        );

        let ack = DefaultValidator.acknowledgement(&offer.body).unwrap();
        h.push(Block::new(BlockKind::Acknowledgement, ack)).await;

        // The bot answers with the final acknowledgement and fires ready.
        h.next_out(BlockKind::Acknowledgement).await;
        h.ready.wait_for(|r| *r).await.unwrap();
    }

    #[tokio::test]
    async fn test_bot_rejects_bad_acknowledgement() {
        let mut h = Harness::spawn(bot_options());

        h.next_out(BlockKind::Handshake).await;
        h.push(Block::new(BlockKind::Acknowledgement, Bytes::from_static(b"garbage")))
            .await;

        assert_eq!(h.wait_closed().await, DisconnectReason::Handshake);
    }

    #[tokio::test]
    async fn test_fetch_resolves_with_matching_response() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let commander = h.commander.clone();
        let fetched = tokio::spawn(async move {
            commander.fetch("echo", Bytes::from_static(b"hi")).await
        });

        let out = h.next_out(BlockKind::Data).await;
        let request = h.decode_out(&out);
        assert_eq!(request.kind, PayloadKind::Request);
        assert_eq!(request.name, "echo");
        assert_eq!(request.id, 0);
        assert_eq!(&request.data[..], b"hi");

        h.push_envelope(&Envelope::response("echo", request.id, Bytes::from_static(b"hi")))
            .await;

        let envelope = fetched.await.unwrap().unwrap();
        assert_eq!(envelope.name, "echo");
        assert_eq!(&envelope.data[..], b"hi");
        assert!(!envelope.is_failure());
    }

    #[tokio::test]
    async fn test_request_callback_fires_once_with_timeout() {
        let mut options = bot_options();
        options.request_timeout = Duration::from_millis(50);
        let mut h = Harness::spawn(options);
        h.complete_bot_handshake().await;

        let envelope = timeout(
            Duration::from_secs(2),
            h.commander.fetch("slow", Bytes::new()),
        )
        .await
        .expect("timeout never fired")
        .unwrap();

        assert_eq!(envelope.error, "timeout");
        assert_eq!(envelope.name, "slow");
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_ignored() {
        let mut options = bot_options();
        options.request_timeout = Duration::from_millis(50);
        let mut h = Harness::spawn(options);
        h.complete_bot_handshake().await;

        let commander = h.commander.clone();
        let expired = tokio::spawn(async move { commander.fetch("slow", Bytes::new()).await });
        let out = h.next_out(BlockKind::Data).await;
        let slow_request = h.decode_out(&out);
        assert_eq!(slow_request.name, "slow");

        let envelope = expired.await.unwrap().unwrap();
        assert_eq!(envelope.error, "timeout");

        // The peer answers long after expiry; the record is gone, the
        // engine just warns. Prove the connection still works.
        h.push_envelope(&Envelope::response("slow", slow_request.id, Bytes::new()))
            .await;

        let commander = h.commander.clone();
        let fetched =
            tokio::spawn(async move { commander.fetch("echo", Bytes::new()).await });
        let out = h.next_out(BlockKind::Data).await;
        let request = h.decode_out(&out);
        h.push_envelope(&Envelope::response("echo", request.id, Bytes::new()))
            .await;
        assert!(fetched.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_abandons_pending_request() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let id = h
            .commander
            .request("job", Bytes::new(), move |_| flag.store(true, Ordering::SeqCst));

        let out = h.next_out(BlockKind::Data).await;
        let request = h.decode_out(&out);
        assert_eq!(request.id, id);

        h.commander.cancel(id);
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.push_envelope(&Envelope::response("job", id, Bytes::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_command_fanout_in_registration_order() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        h.commander
            .on("tick", move |_| first.lock().unwrap().push(1));
        h.commander
            .on("tick", move |_| second.lock().unwrap().push(2));
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.push_envelope(&Envelope::command("tick", Bytes::from_static(b"T")))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_off_removes_single_subscription() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let sub1 = h
            .commander
            .on("tick", move |_| first.lock().unwrap().push(1));
        h.commander
            .on("tick", move |_| second.lock().unwrap().push(2));
        h.commander.off("tick", Some(sub1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.push_envelope(&Envelope::command("tick", Bytes::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_duplicate_request_handler_keeps_existing() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let f = first.clone();
        let s = second.clone();
        h.commander
            .on_request("work", move |_, _| f.store(true, Ordering::SeqCst));
        h.commander
            .on_request("work", move |_, _| s.store(true, Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.push_envelope(&Envelope::request("work", 9, Bytes::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(first.load(Ordering::SeqCst));
        assert!(!second.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bot_request_handler_responds() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        h.commander.on_request("double", |commander, envelope| {
            let mut doubled = envelope.data.to_vec();
            doubled.extend_from_slice(&envelope.data);
            commander.response(&envelope, doubled);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.push_envelope(&Envelope::request("double", 5, Bytes::from_static(b"ab")))
            .await;

        let out = h.next_out(BlockKind::Data).await;
        let response = h.decode_out(&out);
        assert_eq!(response.kind, PayloadKind::Response);
        assert_eq!(response.id, 5);
        assert_eq!(&response.data[..], b"abab");
    }

    fn service_options(pulse_interval: Duration, pulse_limit: u32) -> EngineOptions {
        let mut config = Config::default();
        config.pulse_interval = pulse_interval;
        config.pulse_limit = pulse_limit;
        EngineOptions::new(Role::Service, &config)
    }

    async fn complete_service_handshake(h: &mut Harness) {
        let offer = DefaultValidator.handshake(None).unwrap();
        h.push(Block::new(BlockKind::Handshake, offer)).await;
        let ack = h.next_out(BlockKind::Acknowledgement).await;
        // The peer's closing acknowledgement moves the service to Work.
        let reply = DefaultValidator.acknowledgement(&ack.body).unwrap();
        h.push(Block::new(BlockKind::Acknowledgement, reply)).await;
        h.ready.wait_for(|r| *r).await.unwrap();
    }

    #[tokio::test]
    async fn test_service_acknowledges_valid_offer() {
        let mut h = Harness::spawn(service_options(Duration::from_secs(30), 3));

        let offer = DefaultValidator.handshake(Some(b"hello")).unwrap();
        h.push(Block::new(BlockKind::Handshake, offer)).await;

        let ack = h.next_out(BlockKind::Acknowledgement).await;
        assert_eq!(
            DefaultValidator.verify_acknowledgement(&ack.body),
            Verdict::Success
        );
    }

    #[tokio::test]
    async fn test_service_kicks_on_bad_offer() {
        let mut h = Harness::spawn(service_options(Duration::from_secs(30), 3));

        h.push(Block::new(BlockKind::Handshake, Bytes::from_static(b"junk")))
            .await;

        let kick = h.next_out(BlockKind::Kick).await;
        assert_eq!(
            DisconnectReason::parse_kick_body(&kick.body),
            DisconnectReason::Handshake
        );
        assert_eq!(h.wait_closed().await, DisconnectReason::Handshake);
    }

    #[tokio::test]
    async fn test_service_pongs_heartbeat() {
        let mut h = Harness::spawn(service_options(Duration::from_secs(30), 3));
        complete_service_handshake(&mut h).await;

        h.push(Block::empty(BlockKind::Heartbeat)).await;
        h.next_out(BlockKind::Heartbeat).await;
    }

    #[tokio::test]
    async fn test_service_kicks_after_silent_pulse_limit() {
        let mut h = Harness::spawn(service_options(Duration::from_millis(20), 2));
        complete_service_handshake(&mut h).await;

        // Silence. Limit 2 means the third tick fires.
        let kick = h.next_out(BlockKind::Kick).await;
        assert_eq!(
            DisconnectReason::parse_kick_body(&kick.body),
            DisconnectReason::Timeout
        );
        assert_eq!(h.wait_closed().await, DisconnectReason::Timeout);
    }

    #[tokio::test]
    async fn test_inbound_traffic_defers_service_kick() {
        let mut h = Harness::spawn(service_options(Duration::from_millis(30), 2));
        complete_service_handshake(&mut h).await;

        // Heartbeat faster than the pulse interval; no kick may appear.
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            h.push(Block::empty(BlockKind::Heartbeat)).await;
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert!(h.closed.borrow().is_none());
    }

    #[tokio::test]
    async fn test_bot_heartbeats_every_silent_tick() {
        let mut config = Config::default();
        config.pulse_interval = Duration::from_millis(20);
        let options = EngineOptions::new(Role::Bot, &config);
        let mut h = Harness::spawn(options);
        h.complete_bot_handshake().await;

        for _ in 0..3 {
            h.next_out(BlockKind::Heartbeat).await;
        }
        assert!(h.closed.borrow().is_none());
    }

    #[tokio::test]
    async fn test_kick_sends_block_then_disconnects() {
        let mut h = Harness::spawn(service_options(Duration::from_secs(30), 3));
        complete_service_handshake(&mut h).await;

        h.commander.kick(DisconnectReason::ServerDown);

        let kick = h.next_out(BlockKind::Kick).await;
        assert_eq!(&kick.body[..], b"3");
        assert_eq!(h.wait_closed().await, DisconnectReason::ServerDown);
    }

    #[tokio::test]
    async fn test_inbound_kick_sets_disconnect_reason() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        h.push(Block::new(
            BlockKind::Kick,
            DisconnectReason::ServerDown.kick_body(),
        ))
        .await;
        // The kicker closes the wire after the block.
        drop(h.wire_in);

        let reason = timeout(
            Duration::from_secs(2),
            h.closed.wait_for(|c| c.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(reason, DisconnectReason::ServerDown);
    }

    #[tokio::test]
    async fn test_transport_close_surfaces_normal_disconnect() {
        let mut h = Harness::spawn(bot_options());
        h.complete_bot_handshake().await;

        let commander = h.commander.clone();
        let pending = tokio::spawn(async move { commander.fetch("orphan", Bytes::new()).await });
        h.next_out(BlockKind::Data).await;

        drop(h.wire_in);
        let reason = timeout(
            Duration::from_secs(2),
            h.closed.wait_for(|c| c.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(reason, DisconnectReason::Normal);

        // Pending futures are dropped on disconnect.
        assert!(pending.await.unwrap().is_err());
    }
}
