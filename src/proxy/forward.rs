use std::io::{self, Cursor};

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::{DialReason, ProxyError, Result};

use super::dialer::Dialer;
use super::protocol::{Headers, ProxyRequest, ProxyTarget};

const RESPONSE_HEAD_LIMIT: usize = 64 * 1024;
const MAX_RESPONSE_HEADERS: usize = 128;
const READ_CHUNK: usize = 8 * 1024;

/// What a forwarded exchange produced.
#[derive(Debug, Clone, Copy)]
pub struct ForwardSummary {
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

/// Replays plain (non-CONNECT) proxy requests against their origin.
///
/// Both heads are written by hand from ordered header lists, so names keep
/// their case and interleaved duplicates keep their positions.
#[derive(Debug, Clone)]
pub struct Forwarder {
    dialer: Dialer,
    max_body_size: usize,
}

impl Forwarder {
    pub fn new(dialer: Dialer, max_body_size: usize) -> Self {
        Self {
            dialer,
            max_body_size,
        }
    }

    /// Forward `request` and stream the answer back to `client`.
    ///
    /// A `DialFailure` is only returned before anything was written to the client.
    pub async fn forward<S>(
        &self,
        client: &mut S,
        request: ProxyRequest,
        target: &ProxyTarget,
    ) -> Result<ForwardSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let body = self.read_body(client, &request).await?;
        let head = encode_request_head(&request, target, body.len());

        let failed = |reason: DialReason| ProxyError::DialFailure {
            target: target.authority(),
            reason,
        };

        let mut upstream = self.dialer.dial(target).await?;
        tracing::info!(upstream = %target, "dial succeeded");

        upstream
            .write_all(&head)
            .await
            .map_err(|e| failed(DialReason::Io(e)))?;
        upstream
            .write_all(&body)
            .await
            .map_err(|e| failed(DialReason::Io(e)))?;
        upstream
            .flush()
            .await
            .map_err(|e| failed(DialReason::Io(e)))?;

        let (response, rest) = read_response_head(&mut upstream).await.map_err(failed)?;
        tracing::debug!(
            status = response.status,
            headers = response.headers.len(),
            "upstream responded"
        );
        let framing = response.framing(&request.method);

        let mut out = response.status_line().into_bytes();
        for (name, value) in response.headers.sanitized().iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        client.write_all(&out).await.map_err(to_client)?;

        let mut reader = BufReader::new(Cursor::new(rest).chain(upstream));
        let response_bytes = copy_body(&mut reader, client, framing).await?;
        client.flush().await.map_err(to_client)?;

        Ok(ForwardSummary {
            status: response.status,
            request_bytes: body.len() as u64,
            response_bytes,
        })
    }

    /// Buffered body bytes plus whatever `Content-Length` says is still on the wire.
    async fn read_body<S>(&self, client: &mut S, request: &ProxyRequest) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        if request.headers.contains("transfer-encoding") {
            return Err(ProxyError::LengthRequired);
        }

        let Some(raw_length) = request.headers.get("content-length") else {
            return Ok(Vec::new());
        };
        let length: usize = raw_length
            .trim()
            .parse()
            .map_err(|_| ProxyError::malformed(format!("invalid Content-Length {:?}", raw_length)))?;
        if length > self.max_body_size {
            return Err(ProxyError::PayloadTooLarge(length));
        }

        let mut body = request.body.clone();
        body.truncate(length);
        let missing = length - body.len();
        if missing > 0 {
            let start = body.len();
            body.resize(length, 0);
            client
                .read_exact(&mut body[start..])
                .await
                .map_err(|e| ProxyError::malformed(format!("request body cut short: {}", e)))?;
        }
        Ok(body)
    }
}

fn to_client(source: io::Error) -> ProxyError {
    ProxyError::RelayIo {
        direction: "upstream->client",
        source,
    }
}

/// Path and query of an absolute `http://` URI, fragment dropped.
fn origin_form(url: &str) -> String {
    let rest = url.get("http://".len()..).unwrap_or_default();
    let rest = rest.split('#').next().unwrap_or_default();
    match rest.find(|c: char| c == '/' || c == '?') {
        Some(i) if rest[i..].starts_with('?') => format!("/{}", &rest[i..]),
        Some(i) => rest[i..].to_string(),
        None => "/".to_string(),
    }
}

/// `Host` value for a request that did not carry one.
fn host_header(target: &ProxyTarget) -> String {
    match (target.port, target.host.contains(':')) {
        (80, true) => format!("[{}]", target.host),
        (80, false) => target.host.clone(),
        _ => target.authority(),
    }
}

/// Request line and sanitized headers, in the order the client sent them.
fn encode_request_head(request: &ProxyRequest, target: &ProxyTarget, body_len: usize) -> Vec<u8> {
    let mut headers = request.headers.sanitized();
    if !headers.contains("host") {
        headers.push("Host", host_header(target));
    }
    if body_len > 0 && !headers.contains("content-length") {
        headers.push("Content-Length", body_len.to_string());
    }

    let mut head = format!(
        "{} {} HTTP/1.1\r\n",
        request.method,
        origin_form(&request.target)
    )
    .into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// How the upstream delimits its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Status line and headers of an upstream response, as received.
#[derive(Debug)]
struct UpstreamResponse {
    status: u16,
    reason: String,
    headers: Headers,
}

impl UpstreamResponse {
    /// `None` while the head is still incomplete, otherwise the head length too.
    fn parse(buf: &[u8]) -> std::result::Result<Option<(usize, Self)>, DialReason> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(DialReason::Http(format!(
                    "invalid response from upstream: {}",
                    e
                )))
            }
        };

        let status = response
            .code
            .ok_or_else(|| DialReason::Http("response without a status code".into()))?;
        let headers = response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Some((
            len,
            UpstreamResponse {
                status,
                reason: response.reason.unwrap_or_default().to_string(),
                headers,
            },
        )))
    }

    /// 1xx heads other than `101` precede the real response.
    fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Status line reusing the upstream's reason phrase when it sent one.
    fn status_line(&self) -> String {
        let reason = if self.reason.is_empty() {
            http::StatusCode::from_u16(self.status)
                .ok()
                .and_then(|status| status.canonical_reason())
                .unwrap_or_default()
        } else {
            self.reason.as_str()
        };
        format!("HTTP/1.1 {} {}\r\n", self.status, reason)
    }

    fn framing(&self, method: &str) -> Framing {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Framing::Empty;
        }
        if let Some(coding) = self.headers.get("transfer-encoding") {
            let chunked = coding
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            return if chunked {
                Framing::Chunked
            } else {
                Framing::UntilClose
            };
        }
        match self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
        {
            Some(length) => Framing::Length(length),
            None => Framing::UntilClose,
        }
    }
}

/// Read the final response head. Returns it with any body bytes read past it.
async fn read_response_head<R>(
    upstream: &mut R,
) -> std::result::Result<(UpstreamResponse, Vec<u8>), DialReason>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        while let Some((len, response)) = UpstreamResponse::parse(&buffer)? {
            if response.is_interim() {
                tracing::debug!(status = response.status, "skipping interim response");
                buffer.drain(..len);
                continue;
            }
            let rest = buffer.split_off(len);
            return Ok((response, rest));
        }

        if buffer.len() >= RESPONSE_HEAD_LIMIT {
            return Err(DialReason::Http(format!(
                "response head exceeds {} bytes",
                RESPONSE_HEAD_LIMIT
            )));
        }
        let n = upstream.read(&mut chunk).await.map_err(DialReason::Io)?;
        if n == 0 {
            return Err(DialReason::Http(
                "upstream closed before sending a response".into(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Copy the response body to the client, undoing chunked coding.
async fn copy_body<R, W>(reader: &mut R, client: &mut W, framing: Framing) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        Framing::Empty => Ok(0),
        Framing::Length(length) => copy_exact(reader, client, length).await,
        Framing::UntilClose => tokio::io::copy(reader, client).await.map_err(to_client),
        Framing::Chunked => copy_chunked(reader, client).await,
    }
}

async fn copy_exact<R, W>(reader: &mut R, client: &mut W, length: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = (&mut *reader).take(length);
    let copied = tokio::io::copy(&mut limited, client)
        .await
        .map_err(to_client)?;
    if copied < length {
        return Err(to_client(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("upstream closed after {} of {} body bytes", copied, length),
        )));
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(reader: &mut R, client: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        reader.read_until(b'\n', &mut line).await.map_err(to_client)?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        total += copy_exact(reader, client, size).await?;
        line.clear();
        reader.read_until(b'\n', &mut line).await.map_err(to_client)?;
    }

    // trailer fields end with an empty line
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await.map_err(to_client)?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(total)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    std::str::from_utf8(line)
        .ok()
        .map(|line| line.split(';').next().unwrap_or_default().trim())
        .filter(|size| !size.is_empty())
        .and_then(|size| u64::from_str_radix(size, 16).ok())
        .ok_or_else(|| {
            to_client(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid chunk size line {:?}", String::from_utf8_lossy(line)),
            ))
        })
}
