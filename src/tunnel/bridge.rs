use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Byte counts moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies both directions concurrently and returns once both have ended.
///
/// EOF on one side is propagated as a write shutdown on the other, so a
/// well-behaved peer closes its half in turn. An error in either direction
/// cancels the opposite copy so a dead peer never strands the survivor.
pub async fn bridge<A, B>(client: A, upstream: B) -> BridgeStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let cancel = CancellationToken::new();

    let up = tokio::spawn(transfer(
        client_read,
        upstream_write,
        cancel.clone(),
        "client->upstream",
    ));
    let down = tokio::spawn(transfer(
        upstream_read,
        client_write,
        cancel.clone(),
        "upstream->client",
    ));

    let (up, down) = tokio::join!(up, down);
    BridgeStats {
        client_to_upstream: up.unwrap_or_default(),
        upstream_to_client: down.unwrap_or_default(),
    }
}

async fn transfer<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => result,
        _ = cancel.cancelled() => {
            debug!(direction, "Copy cancelled by peer failure");
            return 0;
        }
    };

    match copied {
        Ok(bytes) => {
            let _ = writer.shutdown().await;
            debug!(direction, bytes, "Copy finished");
            bytes
        }
        Err(e) => {
            debug!(direction, error = %e, "Copy failed");
            cancel.cancel();
            let _ = writer.shutdown().await;
            0
        }
    }
}
