//! Server - listener, accept loop, and the live-client set.
//!
//! The server owns a listening socket of the configured transport, mints a
//! [`Client`] with role Service per accepted connection, and records it in
//! a live set keyed by connection id. Lifecycle callbacks run in a fixed
//! order for every event: the before-extensions, then the user's
//! [`Service`], then the after-extensions.
//!
//! [`Server::stop`] broadcasts `Kick(ServerDown)` to every live client,
//! closes the listener, and drains the set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::client::Client;
use crate::codec::{JsonSerializer, Serializer};
use crate::commander::{
    create_engine, Commander, ConnectionHooks, DisconnectReason, EngineOptions, Role,
};
use crate::config::{Config, TransportKind};
use crate::error::Result;
use crate::handler::{ServiceDispatch, TaskRegistry, TaskResult};
use crate::payload::Envelope;
use crate::transport::{connection_id, spawn_stream, spawn_websocket};
use crate::validator::{DefaultValidator, Validator};

/// How long `stop` waits for each kicked client to finish closing.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// User-side lifecycle callbacks. All methods default to no-ops.
pub trait Service: Send + Sync + 'static {
    /// A connection was accepted (handshake not yet done).
    fn on_connect(&self, _client: &Client) {}

    /// The handshake completed; the connection reached Work.
    fn on_ready(&self, _client: &Client) {}

    /// The connection closed. Fired exactly once per connection.
    fn on_disconnect(&self, _client: &Client, _reason: DisconnectReason) {}
}

/// Adapter hooks that observe every connection's lifecycle. One ordered
/// list runs before the [`Service`] callbacks, another after.
pub trait Extension: Send + Sync + 'static {
    /// A connection was accepted.
    fn on_connect(&self, _client: &Client) {}

    /// A connection reached Work.
    fn on_ready(&self, _client: &Client) {}

    /// A connection closed.
    fn on_disconnect(&self, _client: &Client, _reason: DisconnectReason) {}
}

/// Builder for a listening server.
pub struct ServerBuilder<S> {
    config: Config,
    service: Arc<S>,
    registry: TaskRegistry<S>,
    before: Vec<Arc<dyn Extension>>,
    after: Vec<Arc<dyn Extension>>,
    serializer: Arc<dyn Serializer>,
    validator: Arc<dyn Validator>,
}

impl<S: Service> ServerBuilder<S> {
    /// Start a builder around a service implementation.
    pub fn new(config: Config, service: S) -> Self {
        Self {
            config,
            service: Arc::new(service),
            registry: TaskRegistry::new(),
            before: Vec::new(),
            after: Vec::new(),
            serializer: Arc::new(JsonSerializer),
            validator: Arc::new(DefaultValidator),
        }
    }

    /// Register a named task invoked for inbound Commands and Requests.
    /// Request tasks answer through the commander; commands just run.
    pub fn task<F, Fut>(mut self, name: &str, task: F) -> Self
    where
        F: Fn(Arc<S>, Commander, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        self.registry.register(name, task);
        self
    }

    /// Append an extension that runs before the service callbacks.
    pub fn extension_before(mut self, extension: impl Extension) -> Self {
        self.before.push(Arc::new(extension));
        self
    }

    /// Append an extension that runs after the service callbacks.
    pub fn extension_after(mut self, extension: impl Extension) -> Self {
        self.after.push(Arc::new(extension));
        self
    }

    /// Replace the default payload serializer. Both peers must agree.
    pub fn serializer(mut self, serializer: impl Serializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Replace the default handshake validator. Both peers must agree.
    pub fn validator(mut self, validator: impl Validator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Bind the listener and start accepting connections.
    pub async fn bind(self) -> Result<Server<S>> {
        self.config.validate()?;

        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            config: self.config,
            service: self.service,
            registry: Arc::new(self.registry),
            before: self.before,
            after: self.after,
            serializer: self.serializer,
            validator: self.validator,
            clients: DashMap::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        tracing::info!(
            service = %shared.config.service_name,
            transport = ?shared.config.transport,
            "listening on {}",
            local_addr
        );

        Ok(Server {
            shared,
            local_addr,
            shutdown: shutdown_tx,
        })
    }
}

/// State shared between the accept loop, connection hooks, and the handle.
struct ServerShared<S> {
    config: Config,
    service: Arc<S>,
    registry: Arc<TaskRegistry<S>>,
    before: Vec<Arc<dyn Extension>>,
    after: Vec<Arc<dyn Extension>>,
    serializer: Arc<dyn Serializer>,
    validator: Arc<dyn Validator>,
    clients: DashMap<String, Client>,
}

/// A running server.
pub struct Server<S> {
    shared: Arc<ServerShared<S>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl<S: Service> Server<S> {
    /// The bound listener address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.shared.clients.len()
    }

    /// Run a closure against a live client by connection id.
    pub fn with_client<T>(&self, id: &str, f: impl FnOnce(&Client) -> T) -> Option<T> {
        self.shared.clients.get(id).map(|entry| f(entry.value()))
    }

    /// Stop accepting, broadcast `Kick(ServerDown)` to every live client,
    /// and drain the set.
    pub async fn stop(self) {
        tracing::info!(
            service = %self.shared.config.service_name,
            clients = self.shared.clients.len(),
            "server stopping"
        );
        let _ = self.shutdown.send(true);

        let clients: Vec<Client> = self
            .shared
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for client in &clients {
            client.kick(DisconnectReason::ServerDown);
        }
        for client in clients {
            if tokio::time::timeout(STOP_DRAIN_TIMEOUT, client.closed())
                .await
                .is_err()
            {
                tracing::warn!(conn = %client.id(), "client did not close in time, destroying");
                client.destroy();
            }
        }
        self.shared.clients.clear();
    }
}

async fn accept_loop<S: Service>(
    listener: TcpListener,
    shared: Arc<ServerShared<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = admit(socket, addr, shared).await {
                            tracing::debug!("connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("failed to accept connection: {}", e);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Wrap an accepted socket into a Service-role connection and register it
/// before its engine can observe any traffic.
async fn admit<S: Service>(
    socket: TcpStream,
    addr: SocketAddr,
    shared: Arc<ServerShared<S>>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let id = connection_id();

    let transport = match shared.config.transport {
        TransportKind::Stream => spawn_stream(socket, &id),
        TransportKind::WebSocket => {
            let ws = tokio_tungstenite::accept_async(socket).await?;
            spawn_websocket(ws, &id)
        }
    };
    tracing::debug!(conn = %id, peer = %addr, "connection accepted");

    let mut options = EngineOptions::new(Role::Service, &shared.config);
    options.serializer = shared.serializer.clone();
    options.validator = shared.validator.clone();
    options.dispatch = Some(Arc::new(ServiceDispatch {
        service: shared.service.clone(),
        registry: shared.registry.clone(),
    }));
    options.hooks = Arc::new(ServerHooks {
        shared: shared.clone(),
    });

    let (engine, commander, ready, closed) = create_engine(transport, id.clone(), options);
    let client = Client::from_parts(commander, ready, closed, &id);

    shared.clients.insert(id.clone(), client.clone());
    for extension in &shared.before {
        extension.on_connect(&client);
    }
    shared.service.on_connect(&client);
    for extension in &shared.after {
        extension.on_connect(&client);
    }

    tokio::spawn(engine.run());
    Ok(())
}

/// Connection hooks bridging engine events to the service and extensions.
struct ServerHooks<S> {
    shared: Arc<ServerShared<S>>,
}

impl<S: Service> ConnectionHooks for ServerHooks<S> {
    fn on_ready(&self, commander: &Commander) {
        if let Some(client) = self.shared.clients.get(commander.connection_id()) {
            for extension in &self.shared.before {
                extension.on_ready(&client);
            }
            self.shared.service.on_ready(&client);
            for extension in &self.shared.after {
                extension.on_ready(&client);
            }
        }
    }

    fn on_disconnect(&self, commander: &Commander, reason: DisconnectReason) {
        if let Some((_, client)) = self.shared.clients.remove(commander.connection_id()) {
            for extension in &self.shared.before {
                extension.on_disconnect(&client, reason);
            }
            self.shared.service.on_disconnect(&client, reason);
            for extension in &self.shared.after {
                extension.on_disconnect(&client, reason);
            }
        }
    }
}
