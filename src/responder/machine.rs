//! Responder exchange logic.
//!
//! Every inbound exchange is one call to [`ResponderMachine::on_frame`], which
//! returns exactly one reply frame plus the events the exchange produced.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::core::constants::{MIN_FRAME_SIZE, PROTOCOL_VERSION};
use crate::core::{FrameError, ProtocolError, RequestHandler, Result, SessionConfig};
use crate::session::{Arrival, SessionEvent, SessionState};
use crate::transport::{Frame, FrameType, Reassembler, SessionParams, split};

/// Why the channel went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationReason {
    /// The field was lost (card moved away from the reader).
    LinkLoss,
    /// The reader selected another application.
    Deselected,
}

/// Reply to one inbound exchange.
#[derive(Debug)]
pub struct Reply {
    /// Frame to send back.
    pub frame: Frame,
    /// Events produced by the exchange, in order.
    pub events: Vec<SessionEvent>,
}

impl Reply {
    fn new(frame: Frame) -> Self {
        Self {
            frame,
            events: Vec::new(),
        }
    }

    fn with_event(mut self, event: SessionEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Session, fragment and deferred-response state of a responder.
#[derive(Debug)]
pub struct ResponderMachine {
    config: SessionConfig,
    /// Established session, if any.
    session: Option<SessionState>,
    /// Frame size agreed in the handshake.
    max_frame_size: usize,
    /// Frame size the initiator declared; none of its frames may exceed it.
    peer_frame_size: usize,
    /// Request fragments received so far.
    reassembler: Reassembler,
    /// Response fragments not yet sent.
    outgoing: VecDeque<Frame>,
    /// The handler deferred its response.
    awaiting_response: bool,
    /// Deferred response supplied by the application, not yet polled.
    deferred: Option<Vec<u8>>,
    /// Our last reply was a retransmit request.
    requested_retransmit: bool,
    /// When the current channel was selected.
    opened_at: Option<Instant>,
    /// When the channel last went away.
    deactivated_at: Option<Instant>,
}

impl ResponderMachine {
    /// Create a responder with no session.
    pub fn new(config: SessionConfig) -> Self {
        let max_frame_size = config.max_frame_size;
        Self {
            config,
            session: None,
            max_frame_size,
            peer_frame_size: max_frame_size,
            reassembler: Reassembler::new(),
            outgoing: VecDeque::new(),
            awaiting_response: false,
            deferred: None,
            requested_retransmit: false,
            opened_at: None,
            deactivated_at: None,
        }
    }

    /// Get the session bookkeeping.
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// Frame size agreed in the last handshake.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Check if a request is waiting for [`send_later`](Self::send_later).
    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response && self.deferred.is_none()
    }

    /// When the current channel was selected.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Handle one inbound exchange.
    pub fn on_frame<H: RequestHandler + ?Sized>(
        &mut self,
        inbound: std::result::Result<Frame, FrameError>,
        now: Instant,
        handler: &mut H,
    ) -> Reply {
        let frame = match inbound {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "responder: corrupt frame");
                if self.session.is_none() {
                    return Reply::new(Frame::error(&e.to_string()));
                }
                return self.request_retransmit(ProtocolError::CorruptFrame(e));
            }
        };

        if frame.is_channel_select() {
            tracing::debug!("responder: channel selected");
            self.opened_at = Some(now);
            return Reply::new(Frame::channel_select_ack());
        }
        if frame.is_keep_alive_probe() {
            tracing::trace!("responder: keep-alive");
            return Reply::new(Frame::keep_alive_ack());
        }

        if frame.version > PROTOCOL_VERSION {
            return self.fatal(ProtocolError::VersionIncompatible {
                supported: PROTOCOL_VERSION,
                received: frame.version,
            });
        }
        if frame.frame_type == FrameType::SessionId {
            return self.on_session_id(&frame, now);
        }

        let Some(session) = self.session.as_mut() else {
            return self.fatal(ProtocolError::HandshakeFailed(format!(
                "{:?} frame before session established",
                frame.frame_type
            )));
        };

        if frame.frame_type == FrameType::Retransmit {
            return self.on_retransmit_request();
        }
        if let Err(e) = frame.check_size(self.peer_frame_size) {
            tracing::warn!(error = %e, "responder: oversized frame");
            return self.request_retransmit(ProtocolError::CorruptFrame(e));
        }

        match session.classify(frame.sequence) {
            Arrival::InOrder => session.accept(frame.sequence),
            Arrival::Repeat => {
                tracing::warn!(seq = frame.sequence, "responder: repeated frame, replaying reply");
                return self.replay();
            }
            Arrival::OutOfOrder { expected } => {
                return self.request_retransmit(ProtocolError::SequenceMismatch {
                    expected,
                    actual: frame.sequence,
                });
            }
        }
        self.requested_retransmit = false;

        tracing::debug!(
            seq = frame.sequence,
            frame_type = ?frame.frame_type,
            more = frame.has_more_fragments(),
            "responder: frame accepted"
        );

        match frame.frame_type {
            FrameType::Default => self.on_data(&frame, handler),
            FrameType::GetNextFragment if self.outgoing.is_empty() => {
                self.fatal(unexpected(&frame, "no response fragments left"))
            }
            FrameType::GetNextFragment => self.next_fragment(Vec::new()),
            FrameType::Polling => self.on_poll(&frame),
            FrameType::Error => self.fatal(ProtocolError::PeerError(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            _ => self.fatal(unexpected(&frame, "exchanging data")),
        }
    }

    /// Supply the response to a deferred request.
    pub fn send_later(&mut self, payload: Vec<u8>) -> Result<()> {
        if self.session.is_none() {
            return Err(ProtocolError::NotConnected);
        }
        if !self.is_awaiting_response() {
            return Err(ProtocolError::NoDeferredRequest);
        }
        tracing::debug!(len = payload.len(), "responder: deferred response ready");
        self.deferred = Some(payload);
        Ok(())
    }

    /// Record that the channel went away. Returns whether a session is at stake.
    pub fn on_deactivated(&mut self, reason: DeactivationReason, now: Instant) -> bool {
        self.deactivated_at = Some(now);
        self.opened_at = None;
        tracing::debug!(?reason, has_session = self.session.is_some(), "responder: deactivated");
        self.session.is_some()
    }

    /// Drop the session and everything buffered for it.
    pub fn discard_session(&mut self) {
        self.session = None;
        self.clear_buffers();
    }

    fn clear_buffers(&mut self) {
        self.reassembler.clear();
        self.outgoing.clear();
        self.awaiting_response = false;
        self.deferred = None;
        self.requested_retransmit = false;
    }

    fn on_session_id(&mut self, frame: &Frame, now: Instant) -> Reply {
        let params = match SessionParams::from_bytes(&frame.payload) {
            Ok(params) => params,
            Err(e) => return self.fatal(ProtocolError::HandshakeFailed(format!("bad session id: {e}"))),
        };
        let max_frame_size = self.config.max_frame_size.min(usize::from(params.max_frame_size));
        if max_frame_size < MIN_FRAME_SIZE {
            return self.fatal(ProtocolError::HandshakeFailed(format!(
                "frame size {max_frame_size} below minimum {MIN_FRAME_SIZE}"
            )));
        }

        let reconnected_at = self.opened_at.unwrap_or(now);
        let within_window = self
            .deactivated_at
            .is_none_or(|at| reconnected_at.duration_since(at) <= self.config.resume_threshold);
        let same_session = self
            .session
            .as_ref()
            .is_some_and(|s| s.session_id() == params.session_id);
        self.deactivated_at = None;
        self.peer_frame_size = usize::from(params.max_frame_size);

        if frame.flags.is_resume() && same_session && within_window {
            tracing::info!(session_id = params.session_id, "responder: session resumed");
            return Reply::new(Frame::session_ack(true)).with_event(SessionEvent::SessionInitialized {
                session_id: params.session_id,
                resumed: true,
            });
        }

        if frame.flags.is_resume() {
            tracing::debug!(same_session, within_window, "responder: resume declined");
        }
        tracing::info!(
            session_id = params.session_id,
            max_frame_size,
            "responder: session initialized"
        );
        self.session = Some(SessionState::new(params.session_id, self.config.max_retransmits));
        self.max_frame_size = max_frame_size;
        self.clear_buffers();

        Reply::new(Frame::session_ack(false)).with_event(SessionEvent::SessionInitialized {
            session_id: params.session_id,
            resumed: false,
        })
    }

    fn on_data<H: RequestHandler + ?Sized>(&mut self, frame: &Frame, handler: &mut H) -> Reply {
        if self.reassembler.is_empty() && (self.awaiting_response || !self.outgoing.is_empty()) {
            tracing::warn!("responder: new request while a response was pending, dropping it");
            self.outgoing.clear();
            self.awaiting_response = false;
            self.deferred = None;
        }

        if let Err(e) = self.reassembler.reassemble(frame) {
            return self.fatal(e);
        }
        if !self.reassembler.is_complete() {
            return self.stamp(Frame::get_next_fragment());
        }

        let request = self.reassembler.take();
        tracing::debug!(len = request.len(), "responder: request complete");
        let received = SessionEvent::MessageReceived(request.clone());

        match handler.handle(&request) {
            Some(response) => {
                self.outgoing = split(&response, self.max_frame_size).into();
                self.next_fragment(vec![received])
            }
            None => {
                tracing::debug!("responder: response deferred");
                self.awaiting_response = true;
                let mut reply = self.stamp(Frame::polling(false));
                reply.events.insert(0, received);
                reply
            }
        }
    }

    fn on_poll(&mut self, frame: &Frame) -> Reply {
        if !self.awaiting_response {
            return self.fatal(unexpected(frame, "no response deferred"));
        }
        match self.deferred.take() {
            Some(response) => {
                self.awaiting_response = false;
                self.outgoing = split(&response, self.max_frame_size).into();
                self.next_fragment(Vec::new())
            }
            None => self.stamp(Frame::polling(false)),
        }
    }

    /// Send the next queued response fragment.
    fn next_fragment(&mut self, events: Vec<SessionEvent>) -> Reply {
        let Some(fragment) = self.outgoing.pop_front() else {
            return self.fatal(ProtocolError::UnexpectedFrame {
                frame_type: FrameType::GetNextFragment,
                state: "no response queued",
            });
        };
        let last = !fragment.has_more_fragments();
        let mut reply = self.stamp(fragment);
        reply.events = events;
        if last {
            reply.events.push(SessionEvent::MessageSent);
        }
        reply
    }

    fn stamp(&mut self, frame: Frame) -> Reply {
        match self.session.as_mut() {
            Some(session) => Reply::new(session.stamp(frame)),
            None => self.fatal(ProtocolError::NotConnected),
        }
    }

    /// Resend our last sequenced reply unchanged.
    fn replay(&mut self) -> Reply {
        match self.session.as_ref().and_then(SessionState::last_frame_sent) {
            Some(frame) => {
                let frame = frame.clone();
                self.requested_retransmit = false;
                Reply::new(frame)
            }
            None => self.fatal(ProtocolError::UnexpectedFrame {
                frame_type: FrameType::Retransmit,
                state: "nothing sent yet",
            }),
        }
    }

    /// The initiator asked us to resend our last reply.
    fn on_retransmit_request(&mut self) -> Reply {
        if self.requested_retransmit {
            return self.fatal(ProtocolError::DeadlockRetransmit);
        }
        if let Some(Err(e)) = self.session.as_mut().map(SessionState::record_resend) {
            return self.fatal(e);
        }
        tracing::warn!("responder: peer requested retransmit");
        self.replay()
    }

    /// Ask the initiator to resend its last frame.
    fn request_retransmit(&mut self, cause: ProtocolError) -> Reply {
        let Some(session) = self.session.as_mut() else {
            return self.fatal(ProtocolError::NotConnected);
        };
        if let Err(e) = session.record_request() {
            tracing::error!(cause = %cause, "responder: retransmit limit reached");
            return self.fatal(e);
        }
        tracing::warn!(
            cause = %cause,
            attempt = session.request_count(),
            "responder: requesting retransmit"
        );
        let sequence = session.control_sequence();
        self.requested_retransmit = true;
        Reply::new(Frame::retransmit().with_sequence(sequence))
    }

    /// Tear the session down and answer with an ERROR frame.
    fn fatal(&mut self, error: ProtocolError) -> Reply {
        tracing::error!(error = %error, kind = ?error.kind(), "responder: session failed");
        self.discard_session();
        Reply::new(Frame::error(&error.to_string())).with_event(SessionEvent::fatal(&error))
    }
}

fn unexpected(frame: &Frame, state: &'static str) -> ProtocolError {
    ProtocolError::UnexpectedFrame {
        frame_type: frame.frame_type,
        state,
    }
}
