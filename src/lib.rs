//! Authenticated HTTP forward proxy and CONNECT tunnel.
//!
//! A connection is read up to the end of its request head, parsed, checked
//! against the configured proxy credentials, then either tunneled byte for byte
//! to a `host:port` (CONNECT) or replayed as a plain HTTP request against its
//! absolute URI.

pub mod app_state;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod tracer;
pub mod utils;

pub use app_state::AppState;
pub use config::Config;
pub use error::ProxyError;
pub use proxy::listener::{bind_and_run, run_proxy_server};
