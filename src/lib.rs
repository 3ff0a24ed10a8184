//! # tether
//!
//! Bidirectional RPC for long-lived duplex connections.
//!
//! Peers exchange length-framed binary blocks over TCP or WebSocket. Once
//! a two-phase handshake succeeds, either end may invoke named commands
//! (fire-and-forget) or named requests (awaiting responses), subscribe to
//! events, and is kept alive by a heartbeat. Two roles exist: the server
//! accepts many connections and dispatches to registered tasks; the
//! client/bot opens one outbound connection, invokes, and subscribes.
//!
//! ## Architecture
//!
//! Each connection is one engine task multiplexing inbound blocks, pulse
//! ticks, request timeouts, user operations, and transport closure on a
//! single `select!` loop. The wire unit is a [`protocol::Block`]: one kind
//! octet, a 24-bit big-endian length, and an opaque body. Data-block
//! bodies carry a [`payload::Envelope`] encoded by a pluggable
//! [`codec::Serializer`]; the handshake bodies belong to a pluggable
//! [`validator::Validator`].
//!
//! ## Example
//!
//! ```ignore
//! use tether::{ClientBuilder, Config, ServerBuilder, Service};
//!
//! struct Echo;
//! impl Service for Echo {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tether::TetherError> {
//!     let server = ServerBuilder::new(Config::from_env()?, Echo)
//!         .task("echo", |_service, commander, envelope| async move {
//!             commander.response(&envelope, envelope.data.clone());
//!             Ok(())
//!         })
//!         .bind()
//!         .await?;
//!
//!     let bot = ClientBuilder::from_env()?.connect().await?;
//!     bot.ready().await?;
//!     let reply = bot.fetch("echo", "hi").await?;
//!     assert_eq!(&reply.data[..], b"hi");
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod commander;
pub mod config;
pub mod error;
pub mod handler;
pub mod payload;
pub mod protocol;
pub mod pulse;
pub mod transport;
pub mod validator;

mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use commander::{Commander, ConnectionHooks, DisconnectReason, Role};
pub use config::{Config, TransportKind};
pub use error::{Result, TetherError};
pub use payload::{Envelope, PayloadKind};
pub use server::{Extension, Server, ServerBuilder, Service};
