use base64::Engine;
use ring::digest::{digest, SHA256, SHA256_OUTPUT_LEN};

use crate::error::{ProxyError, Result};

type Digest = [u8; SHA256_OUTPUT_LEN];

/// Expected proxy credentials, kept only as SHA-256 digests.
#[derive(Clone)]
pub struct Credential {
    username: Digest,
    password: Digest,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: sha256(username.as_bytes()),
            password: sha256(password.as_bytes()),
        }
    }

    /// Both fields are always compared so a matching username earns nothing.
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        let username_ok = constant_time_eq(&self.username, &sha256(username));
        let password_ok = constant_time_eq(&self.password, &sha256(password));
        username_ok & password_ok
    }
}

/// Gate in front of every proxied request.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    expected: Option<Credential>,
}

impl Authenticator {
    /// Open proxy, every request passes.
    pub fn open() -> Self {
        Self { expected: None }
    }

    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            expected: Some(Credential::new(username, password)),
        }
    }

    pub fn from_config(username: Option<&str>, password: Option<&str>) -> Self {
        match (username, password) {
            (Some(user), Some(pass)) => Self::with_credentials(user, pass),
            _ => Self::open(),
        }
    }

    pub fn requires_credentials(&self) -> bool {
        self.expected.is_some()
    }

    /// Check the raw `Proxy-Authorization` value of a request.
    pub fn authenticate(&self, proxy_auth: Option<&str>) -> Result<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };

        let header = proxy_auth.ok_or(ProxyError::AuthenticationFailure(
            "missing Proxy-Authorization header",
        ))?;
        let (username, password) = decode_basic(header)?;

        if expected.matches(&username, &password) {
            Ok(())
        } else {
            Err(ProxyError::AuthenticationFailure("invalid credentials"))
        }
    }
}

/// Split a `Basic <base64(user:pass)>` header value into its raw parts.
pub fn decode_basic(header: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let (scheme, encoded) = header
        .trim()
        .split_once(' ')
        .ok_or(ProxyError::AuthenticationFailure("malformed Proxy-Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(ProxyError::AuthenticationFailure(
            "unsupported authentication scheme",
        ));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ProxyError::AuthenticationFailure("invalid base64 encoding"))?;

    let colon = decoded
        .iter()
        .position(|&b| b == b':')
        .ok_or(ProxyError::AuthenticationFailure("missing password"))?;

    Ok((decoded[..colon].to_vec(), decoded[colon + 1..].to_vec()))
}

fn sha256(data: &[u8]) -> Digest {
    let mut out = [0u8; SHA256_OUTPUT_LEN];
    out.copy_from_slice(digest(&SHA256, data).as_ref());
    out
}

/// Equality over fixed-size digests without an early exit.
fn constant_time_eq(a: &Digest, b: &Digest) -> bool {
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    std::hint::black_box(acc) == 0
}
