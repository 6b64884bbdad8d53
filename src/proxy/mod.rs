//! Per-connection request handling.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → handler.rs on_data (start time, byte count, buffer append)
//!     → scanner.rs (until the header block is complete)
//!     → PolicyEvaluator (exactly once)
//!         → allow: BackendConnector, then relay buffer + later chunks
//!         → deny:  composer.rs → Transport::send → close after writing
//! backend bytes
//!     → handler.rs on_response (byte count only)
//! ```
//!
//! # Design Decisions
//! - The handler is synchronous and I/O-free; server.rs drives it from a
//!   Tokio task through outbox.rs
//! - Forward and reject are mutually exclusive phases, never both
//! - The buffer is never split: body bytes that share a chunk with the end
//!   of the headers are relayed untouched

pub mod composer;
pub mod counter;
pub mod decision;
pub mod handler;
pub mod outbox;
pub mod scanner;
pub mod server;

pub use composer::{ComposedResponse, Released, ResponseComposer};
pub use counter::ByteCounter;
pub use decision::{
    BackendConnector, BackendError, BackendTarget, Connect, PolicyDecision, PolicyError,
    PolicyEvaluator, Transport,
};
pub use handler::{Clock, ConnectionHandler, HandlerError, HandlerOptions, Phase, SystemClock};
pub use scanner::{parse_head, HeadError, HeaderBlockScanner, RequestHead, RequestHeaders, RequestLine};
pub use server::{ProxyServer, SharedPolicy};
