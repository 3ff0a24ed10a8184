//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each outbound block travels as one Binary message. Inbound Binary
//! messages are fed byte-for-byte through the same [`BlockBuffer`] as the
//! stream transport: a message may carry several blocks or a fragment of
//! one, so the framer never relies on message boundaries. Pings are
//! answered by the WebSocket layer itself.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{OutboundBlock, Transport, CHANNEL_CAPACITY};
use crate::protocol::{Block, BlockBuffer};

/// Spawn reader and writer tasks for an established WebSocket.
pub(crate) fn spawn_websocket<S>(ws: WebSocketStream<S>, id: &str) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(read_loop(
        source,
        in_tx,
        shutdown_rx.clone(),
        id.to_string(),
    ));
    tokio::spawn(write_loop(sink, out_rx, shutdown_rx, id.to_string()));

    Transport::new(out_tx, in_rx, shutdown_tx)
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    tx: mpsc::Sender<Block>,
    mut shutdown: watch::Receiver<bool>,
    id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BlockBuffer::new();

    loop {
        let msg = tokio::select! {
            msg = source.next() => msg,
            _ = shutdown.changed() => return,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                for block in buffer.push(&data) {
                    if tx.send(block).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(conn = %id, "peer closed the websocket");
                return;
            }
            Some(Ok(_)) => {} // ping/pong/text carry no frames
            Some(Err(e)) => {
                tracing::debug!(conn = %id, "websocket error: {}", e);
                return;
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<OutboundBlock>,
    mut shutdown: watch::Receiver<bool>,
    id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let block = tokio::select! {
            block = rx.recv() => match block {
                Some(b) => b,
                None => break,
            },
            _ = shutdown.changed() => {
                // Flush blocks queued before the close (a final Kick, say).
                while let Ok(block) = rx.try_recv() {
                    if send_block(&mut sink, block).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if let Err(e) = send_block(&mut sink, block).await {
            tracing::debug!(conn = %id, "websocket write error: {}", e);
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn send_block<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    block: OutboundBlock,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(block.size());
    frame.extend_from_slice(&block.head);
    frame.extend_from_slice(&block.body);
    sink.send(Message::Binary(frame)).await
}
