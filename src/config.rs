use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

pub const DEFAULT_BIND: &str = "0.0.0.0:8888";
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Command line and environment configuration of the proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "connect_proxy", version, about = "Authenticated HTTP forward proxy and CONNECT tunnel")]
pub struct Config {
    /// Address the proxy listens on
    #[arg(long, env = "PROXY_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Expected proxy username; leave both username and password unset for an open proxy
    #[arg(long, env = "PROXY_USERNAME")]
    pub username: Option<String>,

    /// Expected proxy password
    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Only serve CONNECT tunnels, answer other methods with 405
    #[arg(long, env = "PROXY_NO_FORWARD")]
    pub no_forward: bool,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "PROXY_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Close a tunnel direction after this many silent seconds (disabled when unset)
    #[arg(long, env = "PROXY_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Largest accepted request head (request line plus headers) in bytes
    #[arg(long, env = "PROXY_MAX_HEADER_SIZE", default_value_t = DEFAULT_MAX_HEADER_SIZE)]
    pub max_header_size: usize,

    /// Largest request body forwarded in plain-HTTP mode, in bytes
    #[arg(long, env = "PROXY_MAX_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_SIZE)]
    pub max_body_size: usize,

    /// Static upstream override, e.g. `example.test:443=127.0.0.1:9443` (repeatable)
    #[arg(long = "resolve", value_parser = parse_override)]
    pub overrides: Vec<(String, SocketAddr)>,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8888)),
            username: None,
            password: None,
            no_forward: false,
            connect_timeout_secs: 10,
            idle_timeout_secs: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            overrides: Vec::new(),
            log_level: tracing::Level::INFO,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.username.is_some() != self.password.is_some() {
            bail!("--username and --password must be given together, or neither for an open proxy");
        }
        if self.max_header_size == 0 {
            bail!("--max-header-size must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            bail!("--connect-timeout-secs must be greater than zero");
        }
        if self.idle_timeout_secs == Some(0) {
            bail!("--idle-timeout-secs must be greater than zero when set");
        }
        Ok(())
    }

    pub fn forwarding_enabled(&self) -> bool {
        !self.no_forward
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Static overrides keyed by lowercase `host:port`.
    pub fn override_map(&self) -> HashMap<String, SocketAddr> {
        self.overrides
            .iter()
            .map(|(authority, addr)| (authority.to_ascii_lowercase(), *addr))
            .collect()
    }
}

fn parse_override(raw: &str) -> Result<(String, SocketAddr)> {
    let (authority, addr) = raw
        .split_once('=')
        .context("expected HOST:PORT=ADDR:PORT")?;
    let (host, port) = authority
        .rsplit_once(':')
        .context("override authority must be HOST:PORT")?;
    if host.is_empty() {
        bail!("override host is empty");
    }
    port.parse::<u16>().context("invalid override port")?;
    let addr = addr
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid override address `{}`", addr))?;
    Ok((authority.to_string(), addr))
}
