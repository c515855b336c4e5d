//! Live buffer handoff between an outgoing and an incoming process
//!
//! The incoming process connects once per stream and sends the stream key
//! (`u16` little-endian length, then the key bytes). The outgoing process
//! answers with a snapshot in the dump file format followed by EOF. Unknown
//! streams and empty buffers answer with EOF only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streamcast_rewind::{BufferRegistry, LoadSummary, RewindBuffer};

/// Serve snapshots of `registry` until `token` is cancelled.
pub async fn serve(listener: TcpListener, registry: Arc<BufferRegistry>, token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Handoff server listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if let Err(e) = answer(socket, &registry).await {
                            warn!(%peer, "Handoff request failed: {:#}", e);
                        }
                    });
                }
                Err(e) => warn!("Handoff accept failed: {}", e),
            },
            () = token.cancelled() => break,
        }
    }
    debug!("Handoff server stopped");
}

async fn answer<S>(mut socket: S, registry: &BufferRegistry) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = read_request(&mut socket).await?;
    let buffer = registry.get(&key).map(|entry| Arc::clone(entry.value()));
    let Some(buffer) = buffer else {
        info!(stream = %key, "Handoff requested for unknown stream");
        socket.shutdown().await?;
        return Ok(());
    };

    let summary = buffer.dump_buffer().write_to(&mut socket).await?;
    socket.shutdown().await?;
    info!(
        stream = %key,
        records = summary.records,
        bytes = summary.bytes,
        "Handoff snapshot sent"
    );
    Ok(())
}

async fn read_request<S>(socket: &mut S) -> anyhow::Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = socket.read_u16_le().await.context("Failed to read key length")?;
    let mut key = vec![0u8; usize::from(len)];
    socket.read_exact(&mut key).await.context("Failed to read key")?;
    String::from_utf8(key).context("Stream key is not valid UTF-8")
}

async fn write_request<S>(socket: &mut S, key: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(key.len()).context("Stream key too long for handoff")?;
    socket.write_u16_le(len).await?;
    socket.write_all(key.as_bytes()).await?;
    socket.flush().await?;
    Ok(())
}

/// Request `buffer`'s stream over `socket` and replay the answer into it.
pub async fn request<S>(mut socket: S, buffer: &RewindBuffer) -> anyhow::Result<LoadSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_request(&mut socket, buffer.key()).await?;
    Ok(buffer.load_buffer(socket).await?)
}

/// Pull `buffer`'s history from the outgoing process at `addr`.
pub async fn pull(addr: &str, buffer: &RewindBuffer, timeout: Duration) -> anyhow::Result<LoadSummary> {
    let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .context("Handoff connect timed out")?
        .with_context(|| format!("Failed to connect to handoff source {addr}"))?;
    tokio::time::timeout(timeout, request(socket, buffer))
        .await
        .context("Handoff transfer timed out")?
}
