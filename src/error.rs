use std::io;
use thiserror::Error;

/// Every failure a proxied connection can end with.
///
/// All variants are scoped to a single connection: the listener logs them and
/// keeps accepting.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request line or headers could not be parsed. Closed without a response.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Credentials were required and missing or wrong.
    #[error("proxy authentication failed: {0}")]
    AuthenticationFailure(&'static str),

    /// Upstream could not be reached or did not answer the forwarded request.
    #[error("failed to reach upstream {target}: {reason}")]
    DialFailure { target: String, reason: DialReason },

    /// Read or write failure inside one relay direction.
    #[error("relay i/o error ({direction}): {source}")]
    RelayIo {
        direction: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("request body of {0} bytes exceeds the configured limit")]
    PayloadTooLarge(usize),

    #[error("request body without Content-Length is not supported")]
    LengthRequired,

    #[error("method {0} is not allowed, plain-HTTP forwarding is disabled")]
    MethodNotAllowed(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Why a dial attempt failed.
#[derive(Debug)]
pub enum DialReason {
    Timeout,
    Io(io::Error),
    Http(String),
}

impl std::fmt::Display for DialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialReason::Timeout => write!(f, "connection timed out"),
            DialReason::Io(e) => write!(f, "{}", e),
            DialReason::Http(e) => write!(f, "{}", e),
        }
    }
}

impl ProxyError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProxyError::MalformedRequest(reason.into())
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::AuthenticationFailure(_) => "authentication_failure",
            ProxyError::DialFailure { .. } => "dial_failure",
            ProxyError::RelayIo { .. } => "relay_io",
            ProxyError::PayloadTooLarge(_) => "payload_too_large",
            ProxyError::LengthRequired => "length_required",
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
