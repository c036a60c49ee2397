use std::{net::SocketAddr, time::Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::{error::ProxyError, tracer::RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Tunneling,
    Forwarding,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Tunneling => "tunneling",
            ConnectionState::Forwarding => "forwarding",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Bookkeeping for one accepted client. The sockets themselves are owned by the
/// task driving the connection and dropped with it.
#[derive(Debug)]
pub struct Connection {
    pub id: RequestId,
    pub client_addr: SocketAddr,
    pub upstream_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    started: Instant,
    state: ConnectionState,
}

impl Connection {
    pub fn new(id: RequestId, client_addr: SocketAddr) -> Self {
        Self {
            id,
            client_addr,
            upstream_addr: None,
            created_at: Utc::now(),
            started: Instant::now(),
            state: ConnectionState::Authenticating,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn start_tunnel(&mut self, upstream: SocketAddr) -> Result<(), ProxyError> {
        self.advance(ConnectionState::Tunneling)?;
        self.upstream_addr = Some(upstream);
        Ok(())
    }

    pub fn start_forwarding(&mut self) -> Result<(), ProxyError> {
        self.advance(ConnectionState::Forwarding)
    }

    /// Safe to call more than once.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn advance(&mut self, next: ConnectionState) -> Result<(), ProxyError> {
        if self.state != ConnectionState::Authenticating {
            return Err(ProxyError::Internal(anyhow!(
                "connection {} cannot move from {} to {}",
                self.id,
                self.state,
                next
            )));
        }
        self.state = next;
        Ok(())
    }
}
