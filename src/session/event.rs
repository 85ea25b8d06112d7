//! Session events delivered to the application.

use tokio::sync::mpsc;

use crate::core::{ErrorKind, ProtocolError};

/// Event emitted by an initiator or responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake completed.
    SessionInitialized {
        /// Identity of the conversation.
        session_id: u64,
        /// Whether the previous session was continued.
        resumed: bool,
    },

    /// The last fragment of an outgoing message was delivered.
    MessageSent,

    /// A complete message was reassembled.
    MessageReceived(Vec<u8>),

    /// The session was torn down by a fatal error.
    FatalError {
        /// Error discriminant.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },

    /// The link stayed silent past the resume window.
    ConnectionLost,
}

impl SessionEvent {
    /// Build a `FatalError` event from an error.
    pub fn fatal(error: &ProtocolError) -> Self {
        Self::FatalError {
            kind: error.kind(),
            detail: error.to_string(),
        }
    }
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Receiving half of the event stream.
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

impl EventSink {
    /// Create a connected sink/stream pair.
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Events are dropped if the application stopped listening.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event stream closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_event_carries_kind() {
        let event = SessionEvent::fatal(&ProtocolError::DeadlockRetransmit);
        assert!(matches!(
            event,
            SessionEvent::FatalError { kind: ErrorKind::DeadlockRetransmit, .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sink, mut stream) = EventSink::channel();
        sink.emit(SessionEvent::MessageSent);
        sink.emit(SessionEvent::ConnectionLost);

        assert_eq!(stream.recv().await, Some(SessionEvent::MessageSent));
        assert_eq!(stream.recv().await, Some(SessionEvent::ConnectionLost));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, stream) = EventSink::channel();
        drop(stream);
        sink.emit(SessionEvent::MessageSent);
    }
}
