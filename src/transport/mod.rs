//! Transport module - socket I/O and block framing for one connection.
//!
//! A [`Transport`] owns the byte stream of a single connection. The read
//! half runs as a task that reassembles whole blocks from arbitrary
//! chunking and forwards them over a channel; the write half runs as a
//! dedicated writer task that batches queued blocks into vectored writes.
//! The connection engine talks to both through the `Transport` handle:
//!
//! ```text
//! socket ─► reader task ─► mpsc<Block> ─► Transport::recv
//! Transport::dispatch ─► mpsc<OutboundBlock> ─► writer task ─► socket
//! ```
//!
//! Peer closure (or a hard I/O error) ends the reader task, which closes
//! the inbound channel: `recv` yields `None` exactly once and all further
//! I/O is silenced.

mod stream;
mod websocket;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::config::{Config, TransportKind};
use crate::error::Result;
use crate::protocol::{encode_head, Block, HEAD_SIZE};

pub(crate) use stream::spawn_stream;
pub(crate) use websocket::spawn_websocket;

/// Outbound channel capacity; excess dispatches apply backpressure.
const CHANNEL_CAPACITY: usize = 1024;

/// Length of the random connection identifier used in logs.
const CONNECTION_ID_LEN: usize = 10;

/// Mint the random alphanumeric identifier for a connection. Log-only;
/// never transmitted on the wire.
pub fn connection_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECTION_ID_LEN)
        .map(char::from)
        .collect()
}

/// A block ready to be written to the socket.
#[derive(Debug)]
pub(crate) struct OutboundBlock {
    /// Pre-encoded 4-byte head.
    pub head: [u8; HEAD_SIZE],
    /// Body bytes (possibly empty).
    pub body: Bytes,
}

impl OutboundBlock {
    /// Total size of this block on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEAD_SIZE + self.body.len()
    }
}

impl From<Block> for OutboundBlock {
    fn from(block: Block) -> Self {
        Self {
            head: encode_head(block.kind, block.body.len()),
            body: block.body,
        }
    }
}

/// Handle to one connection's framed byte stream.
pub struct Transport {
    tx: mpsc::Sender<OutboundBlock>,
    rx: mpsc::Receiver<Block>,
    shutdown: watch::Sender<bool>,
    closed: bool,
}

impl Transport {
    fn new(
        tx: mpsc::Sender<OutboundBlock>,
        rx: mpsc::Receiver<Block>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            tx,
            rx,
            shutdown,
            closed: false,
        }
    }

    /// Queue a block for the writer task. No-op once closed; a dead writer
    /// is treated as closure in progress.
    pub async fn dispatch(&self, block: Block) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(block.into()).await;
    }

    /// Receive the next whole inbound block, or `None` once the peer (or
    /// [`close`](Self::close)) ended the connection.
    pub async fn recv(&mut self) -> Option<Block> {
        match self.rx.recv().await {
            Some(block) => Some(block),
            None => {
                self.closed = true;
                None
            }
        }
    }

    /// Gracefully close: stop both I/O tasks and shut the socket down.
    pub fn close(&mut self) {
        self.closed = true;
        let _ = self.shutdown.send(true);
    }

    /// Hard-terminate the connection. Also discards queued inbound blocks.
    pub fn destroy(&mut self) {
        self.close();
        self.rx.close();
    }

    /// Whether closure has been initiated or observed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Build a transport over bare channels, without I/O tasks. The returned
/// ends stand in for the wire: send on the block sender to fake inbound
/// traffic, read the outbound receiver to observe writes.
#[cfg(test)]
pub(crate) fn test_transport() -> (
    Transport,
    mpsc::Sender<Block>,
    mpsc::Receiver<OutboundBlock>,
) {
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, _) = watch::channel(false);
    (Transport::new(out_tx, in_rx, shutdown_tx), in_tx, out_rx)
}

/// Dial the transport selected by the configuration and return the framed
/// connection handle together with the minted connection id.
pub async fn connect(config: &Config) -> Result<(Transport, String)> {
    let id = connection_id();
    let transport = match config.transport {
        TransportKind::Stream => {
            let stream =
                tokio::net::TcpStream::connect((config.host.as_str(), config.port)).await?;
            stream.set_nodelay(true)?;
            spawn_stream(stream, &id)
        }
        TransportKind::WebSocket => {
            let url = format!("ws://{}:{}", config.host, config.port);
            let (ws, _) = tokio_tungstenite::connect_async(url).await?;
            spawn_websocket(ws, &id)
        }
    };
    Ok((transport, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BlockKind;

    #[test]
    fn test_connection_id_shape() {
        let id = connection_id();
        assert_eq!(id.len(), CONNECTION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_connection_ids_are_distinct() {
        let a = connection_id();
        let b = connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_outbound_block_layout() {
        let block = Block::new(BlockKind::Data, Bytes::from_static(b"hello"));
        let out = OutboundBlock::from(block);

        assert_eq!(out.head, [3, 0, 0, 5]);
        assert_eq!(&out.body[..], b"hello");
        assert_eq!(out.size(), HEAD_SIZE + 5);
    }

    #[test]
    fn test_outbound_block_empty_body() {
        let out = OutboundBlock::from(Block::empty(BlockKind::Heartbeat));
        assert_eq!(out.head, [2, 0, 0, 0]);
        assert_eq!(out.size(), HEAD_SIZE);
    }
}
