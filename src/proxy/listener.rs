use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::app_state::AppState;
use crate::connection::Connection;
use crate::error::{DialReason, ProxyError, Result};
use crate::tracer::connection_span;
use crate::utils::{self, read_request_head, write_response};

use super::protocol::{parse_request, ProxyRequest};
use super::relay::tunnel;

pub async fn bind_and_run(state: AppState, addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "proxy listening");
    run_proxy_server(state, listener).await;
    Ok(())
}

/// Accept loop. Never returns; failures stay inside their own connection task.
pub async fn run_proxy_server(state: AppState, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((client_stream, client_addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_client(client_stream, client_addr, state).await;
                });
            }
            Err(e) => {
                // usually fd exhaustion, back off instead of spinning
                tracing::error!(error = %e, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

pub async fn handle_client(mut client_stream: TcpStream, client_addr: SocketAddr, state: AppState) {
    let id = state.request_ids.next_id();
    let span = connection_span(id, client_addr);

    async move {
        let mut conn = Connection::new(id, client_addr);
        if let Err(e) = client_stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let result = serve(&mut client_stream, &mut conn, &state).await;
        let last_state = conn.state();
        conn.close();
        if let Err(e) = client_stream.shutdown().await {
            tracing::debug!(error = %e, "failed to shut down client socket");
        }

        match result {
            Ok(()) => tracing::info!(
                state = %last_state,
                opened_at = %conn.created_at.to_rfc3339(),
                elapsed_ms = conn.elapsed_ms() as u64,
                "request completed"
            ),
            Err(e) => log_failure(&e, &conn),
        }
    }
    .instrument(span)
    .await
}

fn log_failure(error: &ProxyError, conn: &Connection) {
    let elapsed_ms = conn.elapsed_ms() as u64;
    let opened_at = conn.created_at.to_rfc3339();
    let kind = error.kind();
    match error {
        ProxyError::MalformedRequest(_) => {
            tracing::debug!(kind, %error, %opened_at, elapsed_ms, "request rejected")
        }
        ProxyError::Internal(_) => {
            tracing::error!(kind, %error, %opened_at, elapsed_ms, "request failed")
        }
        _ => tracing::warn!(kind, %error, %opened_at, elapsed_ms, "request failed"),
    }
}

/// Best effort: the connection is closed right after either way.
async fn send_error_response<S>(client: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_response(client, response).await {
        let status = String::from_utf8_lossy(response)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        tracing::debug!(error = %e, %status, "failed to send error response");
    }
}

async fn serve(client: &mut TcpStream, conn: &mut Connection, state: &AppState) -> Result<()> {
    let head = read_request_head(client, state.max_header_size).await?;
    let request = parse_request(&head)?;
    tracing::info!(method = %request.method, target = %request.target, "request started");

    if let Err(e) = state
        .authenticator
        .authenticate(request.proxy_auth.as_deref())
    {
        tracing::warn!(reason = %e, "authentication failed");
        send_error_response(client, utils::PROXY_AUTH_REQUIRED).await;
        return Err(e);
    }
    tracing::info!(
        credentials = state.authenticator.requires_credentials(),
        "authentication succeeded"
    );

    if request.is_connect() {
        serve_connect(client, conn, state, request).await
    } else {
        serve_forward(client, conn, state, request).await
    }
}

async fn serve_connect(
    client: &mut TcpStream,
    conn: &mut Connection,
    state: &AppState,
    request: ProxyRequest,
) -> Result<()> {
    let target = request.proxy_target()?;

    // the success line is only written once the upstream is connected
    let mut upstream = match state.dialer.dial(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(upstream = %target, error = %e, "dial failed");
            let response = match &e {
                ProxyError::DialFailure {
                    reason: DialReason::Timeout,
                    ..
                } => utils::GATEWAY_TIMEOUT,
                _ => utils::BAD_GATEWAY,
            };
            send_error_response(client, response).await;
            return Err(e);
        }
    };
    let upstream_addr = upstream
        .peer_addr()
        .context("upstream socket has no peer address")?;
    conn.start_tunnel(upstream_addr)?;
    tracing::info!(upstream = %target, %upstream_addr, "dial succeeded");

    write_response(client, utils::CONNECT_ESTABLISHED)
        .await
        .map_err(|source| ProxyError::RelayIo {
            direction: "upstream->client",
            source,
        })?;

    if !request.body.is_empty() {
        // bytes the client pipelined behind the CONNECT head
        upstream
            .write_all(&request.body)
            .await
            .map_err(|source| ProxyError::RelayIo {
                direction: "client->upstream",
                source,
            })?;
    }
    let early = request.body.len() as u64;

    let summary = tunnel(client.split(), upstream.split(), state.idle_timeout).await;
    tracing::info!(
        upstream = %target,
        sent = summary.client_to_upstream.bytes() + early,
        received = summary.upstream_to_client.bytes(),
        "tunnel closed"
    );
    Ok(())
}

async fn serve_forward(
    client: &mut TcpStream,
    conn: &mut Connection,
    state: &AppState,
    request: ProxyRequest,
) -> Result<()> {
    let Some(forwarder) = &state.forwarder else {
        send_error_response(client, utils::METHOD_NOT_ALLOWED).await;
        return Err(ProxyError::MethodNotAllowed(request.method));
    };

    let target = request.proxy_target()?;
    conn.start_forwarding()?;

    match forwarder.forward(client, request, &target).await {
        Ok(summary) => {
            tracing::info!(
                upstream = %target,
                status = summary.status,
                sent = summary.request_bytes,
                received = summary.response_bytes,
                "response forwarded"
            );
            Ok(())
        }
        Err(e) => {
            let response = match &e {
                ProxyError::DialFailure { .. } => {
                    tracing::warn!(upstream = %target, error = %e, "dial failed");
                    Some(utils::service_unavailable(&e.to_string()))
                }
                ProxyError::LengthRequired => Some(utils::LENGTH_REQUIRED.to_vec()),
                ProxyError::PayloadTooLarge(_) => Some(utils::PAYLOAD_TOO_LARGE.to_vec()),
                _ => None,
            };
            if let Some(response) = response {
                send_error_response(client, &response).await;
            }
            Err(e)
        }
    }
}
