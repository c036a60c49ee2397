use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};
use crate::proxy::protocol::find_head_end;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const PROXY_AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
pub const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";
pub const METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\n\r\n";
pub const LENGTH_REQUIRED: &[u8] = b"HTTP/1.1 411 Length Required\r\n\r\n";
pub const PAYLOAD_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Payload Too Large\r\n\r\n";

const HEAD_READ_CHUNK: usize = 4096;

/// Read from the client until the request head is complete.
///
/// Returns everything read so far, which may run past the head into the body
/// or into early tunnel data. A head longer than `max_header_size` is rejected.
pub async fn read_request_head<S>(stream: &mut S, max_header_size: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(HEAD_READ_CHUNK);
    let mut chunk = [0u8; HEAD_READ_CHUNK];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::malformed(format!("failed to read request: {}", e)))?;
        if n == 0 {
            return Err(ProxyError::malformed(if buffer.is_empty() {
                "client closed before sending a request".to_string()
            } else {
                "client closed in the middle of the request head".to_string()
            }));
        }
        buffer.extend_from_slice(&chunk[..n]);

        match find_head_end(&buffer) {
            Some(end) if end <= max_header_size => return Ok(buffer),
            Some(_) => break,
            None if buffer.len() >= max_header_size => break,
            None => {}
        }
    }

    Err(ProxyError::malformed(format!(
        "request head exceeds {} bytes",
        max_header_size
    )))
}

/// Write one of the canned responses and flush.
pub async fn write_response<S>(stream: &mut S, response: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response).await?;
    stream.flush().await
}

/// `503` with a plain-text body naming what went wrong.
pub fn service_unavailable(reason: &str) -> Vec<u8> {
    let body = format!("{}\n", reason);
    format!(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
