use crate::error::{ProxyError, Result};

/// Headers that only apply to a single transport hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    /// `host:port`, with IPv6 literals bracketed again.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.authority())
    }
}

/// Ordered header list. Names compare case-insensitively and duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy without hop-by-hop headers, original order preserved.
    pub fn sanitized(&self) -> Headers {
        Headers(
            self.0
                .iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .cloned()
                .collect(),
        )
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Headers(iter.into_iter().collect())
    }
}

/// A request as read off the client socket.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
    /// Bytes that followed the header block in the initial read.
    pub body: Vec<u8>,
    pub proxy_auth: Option<String>,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Host and port to dial for this request.
    pub fn proxy_target(&self) -> Result<ProxyTarget> {
        if self.is_connect() {
            parse_connect_target(&self.target)
        } else {
            parse_http_target(&self.target)
        }
    }
}

/// Offset just past the `\r\n\r\n` (or `\n\n`) that ends the request head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|i| i + 4);
    let lf = buf
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse a complete request head. Anything after the blank line becomes the body.
pub fn parse_request(buf: &[u8]) -> Result<ProxyRequest> {
    let head_end = find_head_end(buf).unwrap_or(buf.len());
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProxyError::malformed("request head is not valid UTF-8"))?;

    let mut lines = head.lines().filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::malformed("empty request"))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let [method, target, version] = parts[..] else {
        return Err(ProxyError::malformed(format!(
            "request line has {} tokens, expected 3",
            parts.len()
        )));
    };

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| ProxyError::malformed(format!("header line without `: `: {:?}", line)))?;
        if name.is_empty() {
            return Err(ProxyError::malformed("header line with empty name"));
        }
        headers.push(name, value.trim());
    }

    let proxy_auth = headers.get("proxy-authorization").map(str::to_string);

    Ok(ProxyRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: buf[head_end..].to_vec(),
        proxy_auth,
    })
}

/// `host:port` from a CONNECT request line. IPv6 hosts come bracketed.
pub fn parse_connect_target(authority: &str) -> Result<ProxyTarget> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| ProxyError::malformed(format!("invalid CONNECT target {:?}", authority)))?;
        (host, port)
    } else {
        let (host, port) = authority
            .split_once(':')
            .ok_or_else(|| ProxyError::malformed(format!("CONNECT target {:?} lacks a port", authority)))?;
        if port.contains(':') {
            return Err(ProxyError::malformed(format!(
                "invalid CONNECT target {:?}",
                authority
            )));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(ProxyError::malformed("CONNECT target has an empty host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::malformed(format!("invalid port in {:?}", authority)))?;

    Ok(ProxyTarget {
        host: host.to_string(),
        port,
    })
}

/// Host and port of an absolute `http://` URI.
pub fn parse_http_target(url: &str) -> Result<ProxyTarget> {
    let scheme_len = "http://".len();
    let is_http = url
        .get(..scheme_len)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"));
    if !is_http {
        return Err(ProxyError::malformed(format!(
            "expected an absolute http:// URI, got {:?}",
            url
        )));
    }
    let rest = &url[scheme_len..];
    let authority = rest
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    // userinfo is not part of the dial target
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);

    if authority.is_empty() {
        return Err(ProxyError::malformed(format!("URI {:?} has no host", url)));
    }

    let has_port = match authority.rfind(']') {
        Some(bracket) => authority[bracket..].contains(':'),
        None => authority.contains(':'),
    };
    if has_port {
        parse_connect_target(authority)
    } else {
        let host = authority.trim_start_matches('[').trim_end_matches(']');
        Ok(ProxyTarget {
            host: host.to_string(),
            port: 80,
        })
    }
}
