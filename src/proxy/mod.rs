pub mod auth;
pub mod dialer;
pub mod forward;
pub mod listener;
pub mod protocol;
pub mod relay;
