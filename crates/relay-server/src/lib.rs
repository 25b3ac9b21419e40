//! # circle-relay-server
//!
//! Authenticated WebSocket relay for circle comments and typing signals.
//!
//! - [`auth`] verifies the handshake token and yields the connection identity
//! - [`handlers`] runs the HTTP router and one task per connection
//! - [`cli`] parses the command line
//! - [`config`] loads settings from TOML and the environment
//! - [`metrics`] exports Prometheus metrics

pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Authenticator};
pub use config::Config;
pub use handlers::{app, run_server, AppState};
