//! Policy decisions and the collaborator seams of a connection handler.
//!
//! # Seams
//! - [`PolicyEvaluator`]: decides forward vs. reject once per connection
//! - [`Transport`]: client-facing writes and backend relay
//! - [`BackendConnector`]: establishes the backend connection
//!
//! Each seam is a narrow trait so tests can swap one without touching the
//! others.

use std::fmt;

use bytes::Bytes;
use hyper::StatusCode;
use thiserror::Error;

use crate::proxy::scanner::RequestHead;

/// A backend host/port target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The single verdict produced for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// `200 OK` forwards; anything else rejects with this status.
    pub status: StatusCode,
    /// Response headers, emitted in order on the reject path.
    pub headers: Vec<(String, String)>,
    /// Response body fragments, concatenated on the reject path.
    pub response: Vec<Bytes>,
    /// Backend to forward to. `None` means the handler's default backend.
    pub routing: Option<BackendTarget>,
}

impl PolicyDecision {
    /// Allow the request through to `routing` (or the default backend).
    pub fn forward(routing: Option<BackendTarget>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            response: Vec::new(),
            routing,
        }
    }

    /// Reject the request with a locally composed response.
    pub fn reject(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            response: Vec::new(),
            routing: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_fragment(mut self, fragment: impl Into<Bytes>) -> Self {
        self.response.push(fragment.into());
        self
    }

    pub fn is_forward(&self) -> bool {
        self.status == StatusCode::OK
    }
}

/// The policy collaborator failed to produce a decision.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy unavailable: {0}")]
    Unavailable(String),

    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
}

/// Decides what happens to a connection once its request head is known.
pub trait PolicyEvaluator {
    /// Called exactly once per connection.
    fn evaluate(&self, head: &RequestHead) -> Result<PolicyDecision, PolicyError>;
}

impl<P: PolicyEvaluator + ?Sized> PolicyEvaluator for std::sync::Arc<P> {
    fn evaluate(&self, head: &RequestHead) -> Result<PolicyDecision, PolicyError> {
        (**self).evaluate(head)
    }
}

/// Client-facing and backend-facing byte sinks for one connection.
pub trait Transport {
    /// Queue bytes for the client. Ordered.
    fn send(&mut self, bytes: Bytes);

    /// Close the client connection once every queued byte is flushed.
    fn close_after_writing(&mut self);

    /// Queue bytes for the established backend connection. Ordered.
    fn relay_to_backend(&mut self, bytes: Bytes);
}

/// Outcome of a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    /// The backend connection is established; relaying may start now.
    Ready,
    /// The substrate will report the outcome later.
    Pending,
}

/// Backend connection failures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: BackendTarget,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    Timeout(BackendTarget),

    #[error("backend {0} refused by connector")]
    Refused(BackendTarget),
}

/// Establishes (or reuses) a backend connection for the forward path.
pub trait BackendConnector {
    fn connect(&mut self, target: &BackendTarget) -> Result<Connect, BackendError>;
}
