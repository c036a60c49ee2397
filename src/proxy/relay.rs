use std::time::Duration;

use byte_pool::BytePool;
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Largest single read in either tunnel direction.
pub const RELAY_CHUNK_SIZE: usize = 8 * 1024;

lazy_static! {
    static ref BUFFER_POOL: BytePool<Vec<u8>> = BytePool::<Vec<u8>>::new();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one direction of a tunnel ended.
#[derive(Debug)]
pub enum PipeOutcome {
    /// Source reached EOF and the sink's write side was shut down.
    Eof { bytes: u64 },
    /// A read or write failed after `bytes` were relayed.
    Failed { bytes: u64, error: ProxyError },
}

impl PipeOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            PipeOutcome::Eof { bytes } | PipeOutcome::Failed { bytes, .. } => *bytes,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, PipeOutcome::Eof { .. })
    }
}

/// One direction of a tunnel: copies `source` into `sink` verbatim.
pub struct RelayPipe<R, W> {
    source: R,
    sink: W,
    direction: Direction,
    idle_timeout: Option<Duration>,
    sink_closed: bool,
}

impl<R, W> RelayPipe<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(source: R, sink: W, direction: Direction) -> Self {
        Self {
            source,
            sink,
            direction,
            idle_timeout: None,
            sink_closed: false,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Pump until EOF or the first error. Always ends with the sink shut down.
    pub async fn run(mut self) -> PipeOutcome {
        let mut total = 0u64;
        let result = self.pump(&mut total).await;
        self.close_sink().await;

        match result {
            Ok(()) => PipeOutcome::Eof { bytes: total },
            Err(source) => PipeOutcome::Failed {
                bytes: total,
                error: ProxyError::RelayIo {
                    direction: self.direction.as_str(),
                    source,
                },
            },
        }
    }

    async fn pump(&mut self, total: &mut u64) -> std::io::Result<()> {
        let mut buf = BUFFER_POOL.alloc(RELAY_CHUNK_SIZE);

        loop {
            let n = match self.idle_timeout {
                Some(limit) => timeout(limit, self.source.read(&mut buf[..]))
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "relay idle timeout")
                    })??,
                None => self.source.read(&mut buf[..]).await?,
            };
            if n == 0 {
                return Ok(());
            }

            tracing::trace!(direction = %self.direction, bytes = n, "relayed chunk");

            self.sink.write_all(&buf[..n]).await?;
            *total += n as u64;
        }
    }

    /// Half-close the sink. Repeated calls and shutdown errors are ignored.
    async fn close_sink(&mut self) {
        if self.sink_closed {
            return;
        }
        self.sink_closed = true;
        if let Err(e) = self.sink.shutdown().await {
            tracing::trace!(direction = %self.direction, error = %e, "sink shutdown failed");
        }
    }
}

/// Totals of a finished tunnel.
#[derive(Debug)]
pub struct TunnelSummary {
    pub client_to_upstream: PipeOutcome,
    pub upstream_to_client: PipeOutcome,
}

/// Run both directions of a tunnel until each has terminated on its own.
///
/// A failure in one direction does not cancel the other; the caller drops both
/// sockets after this returns.
pub async fn tunnel<CR, CW, UR, UW>(
    client: (CR, CW),
    upstream: (UR, UW),
    idle_timeout: Option<Duration>,
) -> TunnelSummary
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let (client_read, client_write) = client;
    let (upstream_read, upstream_write) = upstream;

    let outbound = RelayPipe::new(client_read, upstream_write, Direction::ClientToUpstream)
        .with_idle_timeout(idle_timeout)
        .run();
    let inbound = RelayPipe::new(upstream_read, client_write, Direction::UpstreamToClient)
        .with_idle_timeout(idle_timeout)
        .run();

    let (client_to_upstream, upstream_to_client) = tokio::join!(outbound, inbound);

    for outcome in [&client_to_upstream, &upstream_to_client] {
        if let PipeOutcome::Failed { error, bytes } = outcome {
            tracing::warn!(error = %error, bytes, "relay direction failed");
        }
    }

    TunnelSummary {
        client_to_upstream,
        upstream_to_client,
    }
}
