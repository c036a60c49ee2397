use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::proxy::{auth::Authenticator, dialer::Dialer, forward::Forwarder};
use crate::tracer::RequestIds;

/// Shared, read-only state handed to every connection task.
#[derive(Debug, Clone)]
pub struct AppState {
    pub authenticator: Authenticator,
    pub dialer: Dialer,
    pub forwarder: Option<Forwarder>,
    pub request_ids: Arc<RequestIds>,
    pub max_header_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let authenticator =
            Authenticator::from_config(config.username.as_deref(), config.password.as_deref());
        let dialer = Dialer::new(config.connect_timeout()).with_overrides(config.override_map());
        let forwarder = config
            .forwarding_enabled()
            .then(|| Forwarder::new(dialer.clone(), config.max_body_size));

        Self {
            authenticator,
            dialer,
            forwarder,
            request_ids: Arc::new(RequestIds::new()),
            max_header_size: config.max_header_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}
