//! Per-connection request handler.
//!
//! # Responsibilities
//! - Record timing and byte counts for both directions
//! - Buffer the inbound stream until the header block is complete
//! - Ask the policy for a decision exactly once
//! - Either relay the stream to a backend or answer the client locally,
//!   never both
//!
//! # Phases
//! ```text
//! AwaitingHead ──(head parsed, allow)──▶ Connecting ──(confirmed)──▶ Forwarding
//!      │                                     │
//!      │                                     └──(connect failed)──▶ Rejected(502)
//!      └──(deny / malformed / too large / policy error)──────────▶ Rejected
//! ```
//!
//! The handler is driven by non-overlapping callbacks from one connection and
//! needs no locking. All work is synchronous; dials and socket writes belong
//! to the substrate behind [`Transport`] and [`BackendConnector`].

use std::fmt;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use hyper::StatusCode;
use thiserror::Error;

use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::proxy::composer::{Released, ResponseComposer};
use crate::proxy::counter::ByteCounter;
use crate::proxy::decision::{
    BackendConnector, BackendError, BackendTarget, Connect, PolicyDecision, PolicyEvaluator,
    Transport,
};
use crate::proxy::scanner::{parse_head, HeaderBlockScanner, RequestHead, RequestHeaders};

/// Source of wall-clock time for `start_time` and the `Date` header.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Per-connection settings shared by every handler of a server.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Where allowed requests go when the decision carries no routing.
    pub default_backend: BackendTarget,
    /// Buffered bytes allowed before the header block must be complete.
    pub max_header_bytes: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            default_backend: BackendTarget::new("127.0.0.1", 3000),
            max_header_bytes: 64 * 1024,
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Buffering until the header block is complete.
    AwaitingHead,
    /// Forward decided; waiting for the backend connection.
    Connecting(BackendTarget),
    /// Relaying bytes to the backend.
    Forwarding(BackendTarget),
    /// Answered locally with this status.
    Rejected(StatusCode),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitingHead => "awaiting_head",
            Phase::Connecting(_) => "connecting",
            Phase::Forwarding(_) => "forwarding",
            Phase::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by the handler to its driver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// An action that the current phase forbids, e.g. client bytes after a
    /// forward decision. The action is dropped.
    #[error("protocol violation: {action} while {phase}")]
    ProtocolViolation {
        action: &'static str,
        phase: &'static str,
    },
}

/// Observable per-connection state.
#[derive(Debug, Default)]
pub struct ConnectionSession {
    start_time: Option<SystemTime>,
    request_bytes: ByteCounter,
    response_bytes: ByteCounter,
    request_buffer: BytesMut,
    headers_parsed: bool,
    head: Option<RequestHead>,
}

/// Drives one client connection from first byte to forward or reject.
pub struct ConnectionHandler<P, T, B, C = SystemClock> {
    id: ConnectionId,
    policy: P,
    transport: T,
    backend: B,
    clock: C,
    options: HandlerOptions,
    scanner: HeaderBlockScanner,
    session: ConnectionSession,
    phase: Phase,
    released: Option<Released>,
    closed: bool,
}

impl<P, T, B> ConnectionHandler<P, T, B, SystemClock>
where
    P: PolicyEvaluator,
    T: Transport,
    B: BackendConnector,
{
    pub fn new(id: ConnectionId, policy: P, transport: T, backend: B, options: HandlerOptions) -> Self {
        Self {
            id,
            policy,
            transport,
            backend,
            clock: SystemClock,
            options,
            scanner: HeaderBlockScanner::new(),
            session: ConnectionSession::default(),
            phase: Phase::AwaitingHead,
            released: None,
            closed: false,
        }
    }
}

impl<P, T, B, C> ConnectionHandler<P, T, B, C>
where
    P: PolicyEvaluator,
    T: Transport,
    B: BackendConnector,
    C: Clock,
{
    /// Replace the clock. Only meaningful before the first chunk arrives.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> ConnectionHandler<P, T, B, C2> {
        ConnectionHandler {
            id: self.id,
            policy: self.policy,
            transport: self.transport,
            backend: self.backend,
            clock,
            options: self.options,
            scanner: self.scanner,
            session: self.session,
            phase: self.phase,
            released: self.released,
            closed: self.closed,
        }
    }

    /// Inbound chunk from the client.
    pub fn on_data(&mut self, chunk: &[u8]) {
        if self.session.start_time.is_none() {
            self.session.start_time = Some(self.clock.now());
        }
        self.session.request_bytes.add(chunk);

        if self.closed {
            tracing::debug!(connection_id = %self.id, bytes = chunk.len(), "Data after close ignored");
            return;
        }

        match self.phase {
            Phase::Forwarding(_) => {
                self.transport.relay_to_backend(Bytes::copy_from_slice(chunk));
            }
            Phase::Rejected(_) => {
                tracing::trace!(connection_id = %self.id, bytes = chunk.len(), "Data after rejection dropped");
            }
            Phase::Connecting(_) => {
                self.session.request_buffer.extend_from_slice(chunk);
            }
            Phase::AwaitingHead => {
                self.session.request_buffer.extend_from_slice(chunk);
                self.scan_for_head();
            }
        }
    }

    /// Outbound chunk from a backend toward the client. Metrics only.
    pub fn on_response(&mut self, source: &str, chunk: &[u8]) {
        self.session.response_bytes.add(chunk);
        tracing::trace!(connection_id = %self.id, source, bytes = chunk.len(), "Response chunk");
    }

    /// The substrate confirmed the pending backend connection.
    pub fn on_backend_connected(&mut self) -> Result<(), HandlerError> {
        match &self.phase {
            Phase::Connecting(target) if !self.closed => {
                let target = target.clone();
                self.start_relay(target);
                Ok(())
            }
            _ => Err(self.violation("backend connected")),
        }
    }

    /// The substrate failed to establish the pending backend connection.
    pub fn on_backend_connect_failed(&mut self, err: BackendError) -> Result<(), HandlerError> {
        match self.phase {
            Phase::Connecting(_) if !self.closed => {
                self.fail_backend(err);
                Ok(())
            }
            _ => Err(self.violation("backend connect failed")),
        }
    }

    /// The client connection closed or errored. Idempotent.
    pub fn on_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if matches!(self.phase, Phase::AwaitingHead | Phase::Connecting(_)) {
            tracing::debug!(
                connection_id = %self.id,
                phase = %self.phase,
                buffered = self.session.request_buffer.len(),
                "Connection closed before relay started"
            );
            self.session.request_buffer = BytesMut::new();
        }

        metrics::record_session_bytes(self.request_size(), self.response_size());
        tracing::debug!(
            connection_id = %self.id,
            phase = %self.phase,
            request_bytes = self.request_size(),
            response_bytes = self.response_size(),
            "Session finished"
        );
    }

    fn scan_for_head(&mut self) {
        match self.scanner.scan(&self.session.request_buffer) {
            Some(end) if end > self.options.max_header_bytes => {
                tracing::info!(
                    connection_id = %self.id,
                    head_bytes = end,
                    limit = self.options.max_header_bytes,
                    "Header block exceeds limit"
                );
                self.reject_locally(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "Request Header Fields Too Large",
                );
            }
            Some(end) => {
                self.session.headers_parsed = true;
                match parse_head(&self.session.request_buffer[..end]) {
                    Ok(head) => {
                        self.session.head = Some(head);
                        self.request_headers_parsed();
                    }
                    Err(err) => {
                        tracing::info!(connection_id = %self.id, error = %err, "Malformed request head");
                        self.reject_locally(StatusCode::BAD_REQUEST, "Bad Request");
                    }
                }
            }
            None if self.session.request_buffer.len() > self.options.max_header_bytes => {
                tracing::info!(
                    connection_id = %self.id,
                    buffered = self.session.request_buffer.len(),
                    limit = self.options.max_header_bytes,
                    "Header block exceeds limit"
                );
                self.reject_locally(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "Request Header Fields Too Large",
                );
            }
            None => {}
        }
    }

    /// Runs once, when the header block has been parsed.
    fn request_headers_parsed(&mut self) {
        let Some(head) = self.session.head.as_ref() else {
            return;
        };

        let decision = match self.policy.evaluate(head) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(connection_id = %self.id, error = %err, "Policy evaluation failed");
                self.reject_locally(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
                return;
            }
        };

        if let Some(start) = self.session.start_time {
            if let Ok(waited) = self.clock.now().duration_since(start) {
                metrics::record_header_wait(waited);
            }
        }

        tracing::debug!(
            connection_id = %self.id,
            request = %head.request_line,
            status = %decision.status,
            "Policy decision"
        );

        if decision.is_forward() {
            let target = decision
                .routing
                .unwrap_or_else(|| self.options.default_backend.clone());
            self.begin_forward(target);
        } else {
            self.respond(decision);
        }
    }

    fn begin_forward(&mut self, target: BackendTarget) {
        match self.backend.connect(&target) {
            Ok(Connect::Ready) => self.start_relay(target),
            Ok(Connect::Pending) => {
                tracing::debug!(connection_id = %self.id, backend = %target, "Backend connect pending");
                self.phase = Phase::Connecting(target);
            }
            Err(err) => self.fail_backend(err),
        }
    }

    fn start_relay(&mut self, target: BackendTarget) {
        tracing::debug!(
            connection_id = %self.id,
            backend = %target,
            buffered = self.session.request_buffer.len(),
            "Relaying to backend"
        );
        metrics::record_decision("forward", StatusCode::OK);
        self.phase = Phase::Forwarding(target);
        let buffered = Bytes::copy_from_slice(&self.session.request_buffer);
        if let Err(err) = self.relay(buffered) {
            tracing::error!(connection_id = %self.id, error = %err, "Initial relay refused");
        }
    }

    fn fail_backend(&mut self, err: BackendError) {
        tracing::warn!(connection_id = %self.id, error = %err, "Backend connection failed");
        metrics::record_backend_failure();
        self.reject_locally(StatusCode::BAD_GATEWAY, "Bad Gateway");
    }

    fn reject_locally(&mut self, status: StatusCode, body: &'static str) {
        let decision = PolicyDecision::reject(status)
            .with_header("Content-Type", "text/plain")
            .with_fragment(body);
        self.respond(decision);
    }

    fn respond(&mut self, decision: PolicyDecision) {
        // Connecting may still turn into a 502; nothing has been relayed yet.
        if let Phase::Forwarding(_) | Phase::Rejected(_) = self.phase {
            let _ = self.violation("respond to client");
            return;
        }

        let response = ResponseComposer::compose(
            decision.status,
            decision.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            decision.response.iter().map(|f| &f[..]),
            self.clock.now(),
        );

        tracing::info!(
            connection_id = %self.id,
            status = %decision.status,
            bytes = response.len(),
            "Rejecting request"
        );
        metrics::record_decision("reject", decision.status);

        self.phase = Phase::Rejected(decision.status);
        self.transport.send(response.bytes());
        self.transport.close_after_writing();
        self.released = Some(response.release());
    }

    fn relay(&mut self, bytes: Bytes) -> Result<(), HandlerError> {
        match self.phase {
            Phase::Forwarding(_) => {
                self.transport.relay_to_backend(bytes);
                Ok(())
            }
            _ => Err(self.violation("relay to backend")),
        }
    }

    fn violation(&self, action: &'static str) -> HandlerError {
        let err = HandlerError::ProtocolViolation {
            action,
            phase: if self.closed { "closed" } else { self.phase.name() },
        };
        tracing::error!(connection_id = %self.id, error = %err, "Protocol violation");
        metrics::record_protocol_violation(action);
        err
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Time of the first inbound chunk.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.session.start_time
    }

    /// Inbound bytes seen so far.
    pub fn request_size(&self) -> u64 {
        self.session.request_bytes.total()
    }

    /// Outbound bytes seen so far.
    pub fn response_size(&self) -> u64 {
        self.session.response_bytes.total()
    }

    /// Everything buffered before forwarding started, headers and body.
    pub fn request_buffer(&self) -> &[u8] {
        &self.session.request_buffer
    }

    pub fn headers_parsed(&self) -> bool {
        self.session.headers_parsed
    }

    pub fn parsed_headers(&self) -> Option<&RequestHeaders> {
        self.session.head.as_ref().map(|head| &head.headers)
    }

    pub fn request_head(&self) -> Option<&RequestHead> {
        self.session.head.as_ref()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Receipt of the locally composed response, once released.
    pub fn released_response(&self) -> Option<Released> {
        self.released
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
