use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{DialReason, ProxyError, Result};

use super::protocol::ProxyTarget;

/// Opens upstream TCP connections. One attempt per call, never retried.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
    overrides: HashMap<String, SocketAddr>,
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            overrides: HashMap::new(),
        }
    }

    /// Static `host:port` overrides consulted before DNS. Keys are lowercase.
    pub fn with_overrides(mut self, overrides: HashMap<String, SocketAddr>) -> Self {
        self.overrides = overrides;
        self
    }

    pub async fn dial(&self, target: &ProxyTarget) -> Result<TcpStream> {
        let authority = target.authority();
        let connect = async {
            match self.overrides.get(&authority.to_ascii_lowercase()) {
                Some(addr) => {
                    tracing::debug!(upstream = %authority, %addr, "using static override");
                    TcpStream::connect(*addr).await
                }
                None => TcpStream::connect((target.host.as_str(), target.port)).await,
            }
        };

        let stream = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::DialFailure {
                target: authority.clone(),
                reason: DialReason::Timeout,
            })?
            .map_err(|e| ProxyError::DialFailure {
                target: authority.clone(),
                reason: DialReason::Io(e),
            })?;

        // relay writes are small and latency sensitive
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(upstream = %authority, error = %e, "failed to set TCP_NODELAY");
        }
        Ok(stream)
    }
}
