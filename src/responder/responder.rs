//! High-level responder API.
//!
//! Provides [`Responder<H>`], the card side of a session. The channel driver
//! calls [`Responder::process`] once per inbound exchange; complete requests go
//! to the application's [`RequestHandler`].

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::{RequestHandler, Result, SessionConfig};
use crate::session::{EventSink, EventStream, SessionEvent, Watchdog};
use crate::transport::Frame;

use super::machine::{DeactivationReason, ResponderMachine};

/// State guarded by the responder's lock.
struct Inner<H> {
    machine: ResponderMachine,
    handler: H,
    /// Armed while the channel is away.
    watchdog: Option<Watchdog>,
    /// Bumped for every watchdog armed, so a stale one cannot discard a newer session.
    generation: u64,
}

impl<H> Inner<H> {
    fn cancel_watchdog(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }
}

/// Card side of a NEARLINK session.
///
/// Cheap to clone; clones share the same session, so one can be handed to the
/// task that produces deferred responses.
///
/// # Example
///
/// ```ignore
/// use nearlink::prelude::*;
///
/// let (responder, mut events) = Responder::new(
///     |request: &[u8]| Some(request.to_vec()),
///     SessionConfig::default(),
/// );
///
/// // From the card-emulation service:
/// let reply = responder.process(&apdu).await;
/// ```
pub struct Responder<H> {
    inner: Arc<Mutex<Inner<H>>>,
    events: EventSink,
    config: SessionConfig,
}

impl<H> Clone for Responder<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H> fmt::Debug for Responder<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<H: RequestHandler> Responder<H> {
    /// Create a responder.
    ///
    /// Returns the responder and the stream of session events.
    pub fn new(handler: H, config: SessionConfig) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        let responder = Self {
            inner: Arc::new(Mutex::new(Inner {
                machine: ResponderMachine::new(config.clone()),
                handler,
                watchdog: None,
                generation: 0,
            })),
            events,
            config,
        };
        (responder, stream)
    }

    /// Handle one inbound exchange and return the reply bytes.
    ///
    /// Never fails: protocol errors are answered with an ERROR frame and
    /// reported on the event stream.
    pub async fn process(&self, apdu: &[u8]) -> Vec<u8> {
        tracing::trace!(bytes = ?apdu, "responder: <<");
        let decoded = Frame::decode(apdu);

        let reply = {
            let mut inner = self.inner.lock().await;
            inner.cancel_watchdog();
            let Inner { machine, handler, .. } = &mut *inner;
            machine.on_frame(decoded, Instant::now(), handler)
        };

        for event in reply.events {
            self.events.emit(event);
        }
        let bytes = reply.frame.encode();
        tracing::trace!(bytes = ?bytes, "responder: >>");
        bytes
    }

    /// Supply the response to a request the handler deferred.
    ///
    /// Returns [`ProtocolError::NoDeferredRequest`](crate::core::ProtocolError::NoDeferredRequest)
    /// if nothing is waiting.
    pub async fn send_later(&self, payload: Vec<u8>) -> Result<()> {
        self.inner.lock().await.machine.send_later(payload)
    }

    /// The channel went away; start the resume window.
    ///
    /// If no exchange arrives before the window closes the session is
    /// discarded and [`SessionEvent::ConnectionLost`] is emitted.
    pub async fn on_deactivated(&self, reason: DeactivationReason) {
        let mut inner = self.inner.lock().await;
        if !inner.machine.on_deactivated(reason, Instant::now()) {
            return;
        }

        inner.cancel_watchdog();
        inner.generation += 1;
        let generation = inner.generation;
        let weak: Weak<Mutex<Inner<H>>> = Arc::downgrade(&self.inner);
        let events = self.events.clone();

        inner.watchdog = Some(Watchdog::arm(self.config.resume_threshold, move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.lock().await;
            if inner.generation != generation || inner.machine.session().is_none() {
                return;
            }
            inner.machine.discard_session();
            tracing::info!("responder: connection lost");
            events.emit(SessionEvent::ConnectionLost);
        }));
    }

    /// Get the current session identifier.
    pub async fn session_id(&self) -> Option<u64> {
        self.inner
            .lock()
            .await
            .machine
            .session()
            .map(|s| s.session_id())
    }

    /// Check if a deferred request is waiting for [`send_later`](Self::send_later).
    pub async fn is_awaiting_response(&self) -> bool {
        self.inner.lock().await.machine.is_awaiting_response()
    }

    /// Get the responder configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::ProtocolError;
    use crate::core::constants::{KEEP_ALIVE_PROBE, SELECT_APDU};
    use crate::transport::{FrameFlags, FrameType, SessionParams};

    fn echo(request: &[u8]) -> Option<Vec<u8>> {
        Some(request.to_vec())
    }

    fn defer(_request: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn session_apdu(session_id: u64, resume: bool) -> Vec<u8> {
        Frame::session_id(SessionParams { session_id, max_frame_size: 245 }, resume).encode()
    }

    fn request(payload: &[u8], seq: u8) -> Vec<u8> {
        Frame::data(payload.to_vec())
            .with_sequence(seq)
            .with_flags(FrameFlags::REQUEST)
            .encode()
    }

    async fn connect<H: RequestHandler>(responder: &Responder<H>, session_id: u64, resume: bool) -> Frame {
        let ack = responder.process(&SELECT_APDU).await;
        assert_eq!(Frame::decode(&ack).unwrap(), Frame::channel_select_ack());
        Frame::decode(&responder.process(&session_apdu(session_id, resume)).await).unwrap()
    }

    fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_process_echo() {
        let (responder, mut events) = Responder::new(echo, SessionConfig::default());
        assert_eq!(connect(&responder, 5, false).await, Frame::session_ack(false));
        assert_eq!(responder.session_id().await, Some(5));

        let reply = Frame::decode(&responder.process(&request(b"hello", 1)).await).unwrap();
        assert_eq!(reply.payload, b"hello".to_vec());
        assert_eq!(reply.sequence, 1);

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::SessionInitialized { session_id: 5, resumed: false },
                SessionEvent::MessageReceived(b"hello".to_vec()),
                SessionEvent::MessageSent,
            ]
        );
    }

    #[tokio::test]
    async fn test_keep_alive_probe() {
        let (responder, mut events) = Responder::new(echo, SessionConfig::default());
        let reply = responder.process(&KEEP_ALIVE_PROBE).await;
        assert_eq!(Frame::decode(&reply).unwrap(), Frame::keep_alive_ack());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_short_apdu_without_session() {
        let (responder, _events) = Responder::new(echo, SessionConfig::default());
        let reply = Frame::decode(&responder.process(&[0x20]).await).unwrap();
        assert_eq!(reply.frame_type, FrameType::Error);
    }

    #[tokio::test]
    async fn test_send_later_from_another_task() {
        let (responder, _events) = Responder::new(defer, SessionConfig::default());
        connect(&responder, 1, false).await;
        assert!(matches!(
            responder.send_later(vec![1]).await,
            Err(ProtocolError::NoDeferredRequest)
        ));

        let reply = Frame::decode(&responder.process(&request(b"slow", 1)).await).unwrap();
        assert_eq!(reply.frame_type, FrameType::Polling);
        assert!(responder.is_awaiting_response().await);

        let worker = responder.clone();
        tokio::spawn(async move { worker.send_later(b"ready".to_vec()).await })
            .await
            .unwrap()
            .unwrap();

        let poll = Frame::polling(true).with_sequence(2).encode();
        let reply = Frame::decode(&responder.process(&poll).await).unwrap();
        assert_eq!(reply.payload, b"ready".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_discards_session() {
        let (responder, mut events) = Responder::new(echo, SessionConfig::default());
        connect(&responder, 3, false).await;
        drain(&mut events);

        responder.on_deactivated(DeactivationReason::LinkLoss).await;
        tokio::time::sleep(Duration::from_millis(301)).await;
        tokio::task::yield_now().await;

        assert_eq!(drain(&mut events), vec![SessionEvent::ConnectionLost]);
        assert_eq!(responder.session_id().await, None);
        assert_eq!(connect(&responder, 3, true).await, Frame::session_ack(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_cancels_watchdog() {
        let (responder, mut events) = Responder::new(echo, SessionConfig::default());
        connect(&responder, 3, false).await;
        responder.process(&request(b"a", 1)).await;
        drain(&mut events);

        responder.on_deactivated(DeactivationReason::LinkLoss).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connect(&responder, 3, true).await, Frame::session_ack(true));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SessionInitialized { session_id: 3, resumed: true }]
        );
        assert_eq!(responder.session_id().await, Some(3));
    }

    #[tokio::test]
    async fn test_deactivated_without_session() {
        let (responder, mut events) = Responder::new(echo, SessionConfig::default());
        responder.on_deactivated(DeactivationReason::Deselected).await;
        assert!(drain(&mut events).is_empty());
    }
}
