//! Queue-backed collaborators for driving a handler from async code.
//!
//! The handler runs synchronously inside a connection task. Instead of doing
//! I/O itself, it leaves writes in an [`Outbox`] and dial requests in a
//! [`Dialer`]; the task performs them after each callback returns.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::proxy::decision::{BackendConnector, BackendError, BackendTarget, Connect, Transport};

/// A queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Client(Bytes),
    Backend(Bytes),
    CloseAfterWriting,
}

/// Ordered queue of pending writes.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Outbound>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&mut self) -> Option<Outbound> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Transport for Outbox {
    fn send(&mut self, bytes: Bytes) {
        self.queue.push_back(Outbound::Client(bytes));
    }

    fn close_after_writing(&mut self) {
        self.queue.push_back(Outbound::CloseAfterWriting);
    }

    fn relay_to_backend(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.queue.push_back(Outbound::Backend(bytes));
        }
    }
}

/// Records the dial request; the connection task performs it.
#[derive(Debug, Default)]
pub struct Dialer {
    pending: Option<BackendTarget>,
    dialed: bool,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the target awaiting a dial, if any.
    pub fn take_pending(&mut self) -> Option<BackendTarget> {
        self.pending.take()
    }
}

impl BackendConnector for Dialer {
    fn connect(&mut self, target: &BackendTarget) -> Result<Connect, BackendError> {
        if self.dialed {
            return Err(BackendError::Refused(target.clone()));
        }
        self.dialed = true;
        self.pending = Some(target.clone());
        Ok(Connect::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_preserves_order() {
        let mut outbox = Outbox::new();
        outbox.send(Bytes::from_static(b"a"));
        outbox.send(Bytes::from_static(b"b"));
        outbox.close_after_writing();

        assert_eq!(outbox.pop(), Some(Outbound::Client(Bytes::from_static(b"a"))));
        assert_eq!(outbox.pop(), Some(Outbound::Client(Bytes::from_static(b"b"))));
        assert_eq!(outbox.pop(), Some(Outbound::CloseAfterWriting));
        assert!(outbox.is_empty());
    }

    #[test]
    fn empty_relay_is_not_queued() {
        let mut outbox = Outbox::new();
        outbox.relay_to_backend(Bytes::new());
        assert!(outbox.is_empty());
    }

    #[test]
    fn dialer_dials_once() {
        let mut dialer = Dialer::new();
        let target = BackendTarget::new("localhost", 3000);
        assert_eq!(dialer.connect(&target).unwrap(), Connect::Pending);
        assert_eq!(dialer.take_pending(), Some(target.clone()));
        assert_eq!(dialer.take_pending(), None);
        assert!(matches!(dialer.connect(&target), Err(BackendError::Refused(_))));
    }
}
