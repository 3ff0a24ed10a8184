//! Connection lifecycle state machine.
//!
//! Owns the Start → Handshake → Work → Closed lifecycle and gates which
//! inbound block kinds are legal in each state. Admitted blocks flow up to
//! the commander; anything else is logged and discarded without advancing
//! state or closing the connection. Closed is terminal.

use bytes::Bytes;

use super::block::{Block, BlockKind};
use crate::transport::Transport;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Nothing exchanged yet.
    Start,
    /// Handshake offer sent or received; waiting for acknowledgement.
    Handshake,
    /// Handshake complete; payload traffic flows.
    Work,
    /// Terminal. No transitions out, all inbound ignored.
    Closed,
}

/// State machine bound to one transport.
pub struct Protocol {
    state: ProtocolState,
    transport: Transport,
    id: String,
}

impl Protocol {
    /// Wrap a connected transport. Initial state is Start.
    pub fn new(transport: Transport, id: impl Into<String>) -> Self {
        Self {
            state: ProtocolState::Start,
            transport,
            id: id.into(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Whether the connection reached Closed.
    pub fn is_closed(&self) -> bool {
        self.state == ProtocolState::Closed
    }

    /// Connection identifier (log-only).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next legal inbound block.
    ///
    /// Illegal (state, kind) pairs are logged and skipped. `None` means the
    /// transport closed; state is then Closed and stays there.
    pub async fn recv(&mut self) -> Option<Block> {
        loop {
            match self.transport.recv().await {
                Some(block) => {
                    if self.admit(&block) {
                        return Some(block);
                    }
                }
                None => {
                    self.state = ProtocolState::Closed;
                    return None;
                }
            }
        }
    }

    /// Apply the inbound gate: advance state for an admitted block and
    /// report whether it may flow upward.
    pub(crate) fn admit(&mut self, block: &Block) -> bool {
        let admitted = match (self.state, block.kind) {
            (ProtocolState::Start, BlockKind::Handshake) => {
                self.state = ProtocolState::Handshake;
                true
            }
            (ProtocolState::Start, BlockKind::Heartbeat) => true,
            (ProtocolState::Handshake, BlockKind::Acknowledgement) => {
                self.state = ProtocolState::Work;
                true
            }
            (ProtocolState::Handshake, BlockKind::Heartbeat | BlockKind::Kick) => true,
            (
                ProtocolState::Work,
                BlockKind::Heartbeat | BlockKind::Kick | BlockKind::Data,
            ) => true,
            _ => false,
        };

        if !admitted && self.state != ProtocolState::Closed {
            tracing::warn!(
                conn = %self.id,
                state = ?self.state,
                kind = ?block.kind,
                "block illegal in current state, discarded"
            );
        }
        admitted
    }

    /// Emit a Data block carrying an encoded payload envelope.
    pub async fn send(&mut self, body: impl Into<Bytes>) {
        self.dispatch(Block::new(BlockKind::Data, body)).await;
    }

    /// Emit a bodyless Heartbeat block.
    pub async fn heartbeat(&mut self) {
        self.dispatch(Block::empty(BlockKind::Heartbeat)).await;
    }

    /// Emit the handshake offer; also moves Start → Handshake on the
    /// initiating side.
    pub async fn handshake(&mut self, body: impl Into<Bytes>) {
        if self.state == ProtocolState::Start {
            self.state = ProtocolState::Handshake;
        }
        self.dispatch(Block::new(BlockKind::Handshake, body)).await;
    }

    /// Emit a handshake acknowledgement.
    pub async fn acknowledge(&mut self, body: impl Into<Bytes>) {
        self.dispatch(Block::new(BlockKind::Acknowledgement, body))
            .await;
    }

    /// Emit a Kick block; the body carries the disconnect reason as decimal
    /// text.
    pub async fn kick(&mut self, body: impl Into<Bytes>) {
        self.dispatch(Block::new(BlockKind::Kick, body)).await;
    }

    /// Transition to Closed and close the transport. Idempotent.
    pub fn disconnect(&mut self) {
        if self.state == ProtocolState::Closed {
            return;
        }
        self.state = ProtocolState::Closed;
        self.transport.close();
    }

    /// Hard-terminate: Closed plus transport destruction.
    pub fn destroy(&mut self) {
        self.state = ProtocolState::Closed;
        self.transport.destroy();
    }

    async fn dispatch(&mut self, block: Block) {
        if self.state == ProtocolState::Closed {
            return;
        }
        self.transport.dispatch(block).await;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: ProtocolState) {
        self.state = state;
    }
}
