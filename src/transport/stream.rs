//! TCP stream transport.
//!
//! The socket splits into a reader task and a writer task. The reader
//! pushes every chunk through a [`BlockBuffer`] and forwards whole blocks;
//! the kernel may fragment frames anywhere, including mid-head. The writer
//! drains its queue in batches and writes them with scatter/gather I/O so a
//! burst of small blocks costs one syscall instead of one per block.

use std::io::IoSlice;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::{OutboundBlock, Transport, CHANNEL_CAPACITY};
use crate::protocol::{Block, BlockBuffer, HEAD_SIZE};

/// Maximum blocks coalesced into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Read buffer size for the reader task.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Spawn reader and writer tasks for a connected TCP stream.
pub(crate) fn spawn_stream(stream: TcpStream, id: &str) -> Transport {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(read_loop(
        read_half,
        in_tx,
        shutdown_rx.clone(),
        id.to_string(),
    ));
    tokio::spawn(write_loop(write_half, out_rx, shutdown_rx, id.to_string()));

    Transport::new(out_tx, in_rx, shutdown_tx)
}

/// Reader task: bytes in, whole blocks out.
async fn read_loop<R>(
    mut reader: R,
    tx: mpsc::Sender<Block>,
    mut shutdown: watch::Receiver<bool>,
    id: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BlockBuffer::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!(conn = %id, "peer closed the stream");
                    return;
                }
                Ok(n) => {
                    for block in buffer.push(&buf[..n]) {
                        if tx.send(block).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(conn = %id, "read error: {}", e);
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Writer task: drains queued blocks and writes them in batches.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<OutboundBlock>,
    mut shutdown: watch::Receiver<bool>,
    id: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            block = rx.recv() => match block {
                Some(b) => b,
                None => break,
            },
            _ = shutdown.changed() => {
                // Blocks queued before the close (a final Kick, say) must
                // still reach the peer.
                let mut tail = Vec::new();
                while let Ok(block) = rx.try_recv() {
                    tail.push(block);
                }
                let _ = write_batch(&mut writer, &tail).await;
                break;
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(block) => batch.push(block),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!(conn = %id, "write error: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Write a batch of blocks with a vectored write, continuing through
/// partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundBlock]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total: usize = batch.iter().map(|b| b.size()).sum();
    let slices = build_slices(batch, 0);

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        ));
    }

    while written < total {
        let remaining = build_slices(batch, written);
        let n = writer.write_vectored(&remaining).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// Build the IoSlice array for a batch, skipping the first `skip_bytes`
/// already written.
fn build_slices(batch: &[OutboundBlock], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for block in batch {
        let head_end = offset + HEAD_SIZE;
        if skip_bytes < head_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&block.head[start..]));
        }
        offset = head_end;

        if !block.body.is_empty() {
            let body_end = offset + block.body.len();
            if skip_bytes < body_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&block.body[start..]));
            }
            offset = body_end;
        }
    }

    slices
}
