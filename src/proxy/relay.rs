//! Bidirectional stream bridge.
//!
//! Splices a client stream and an upstream stream with two independent copy
//! tasks. Each direction runs until its source reaches EOF or fails, then
//! shuts down its destination's write side. A failure in one direction is
//! logged and does not tear down the other, so half-closed connections keep
//! draining.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved by a finished bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Client to upstream
    pub sent: u64,
    /// Upstream to client
    pub received: u64,
}

/// Relay bytes between `client` and `upstream` until both directions end.
pub async fn bridge<C, U>(client: C, upstream: U) -> BridgeStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    // Client → upstream
    let up_task = tokio::spawn(async move {
        let result = tokio::io::copy(&mut client_reader, &mut upstream_writer).await;
        let _ = upstream_writer.shutdown().await;
        result
    });

    // Upstream → client
    let down_task = tokio::spawn(async move {
        let result = tokio::io::copy(&mut upstream_reader, &mut client_writer).await;
        let _ = client_writer.shutdown().await;
        result
    });

    let (up, down) = tokio::join!(up_task, down_task);
    BridgeStats {
        sent: settle("client->upstream", up),
        received: settle("upstream->client", down),
    }
}

fn settle(direction: &str, joined: Result<io::Result<u64>, tokio::task::JoinError>) -> u64 {
    match joined {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::warn!("{} relay error: {}", direction, e);
            0
        }
        Err(e) => {
            tracing::warn!("{} relay task failed: {}", direction, e);
            0
        }
    }
}
