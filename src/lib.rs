//! Authenticating reverse proxy.
//!
//! Each client connection is handled by a [`proxy::ConnectionHandler`] that
//! buffers the request head, asks a policy for a verdict once, and then
//! either relays the raw stream to a backend or answers with a locally
//! composed error response.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod policy;
pub mod proxy;

pub use config::ProxyConfig;
pub use lifecycle::Shutdown;
pub use proxy::{ConnectionHandler, ProxyServer};
