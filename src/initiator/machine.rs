//! Initiator exchange logic.
//!
//! [`InitiatorMachine`] decides, for every reply the channel returns, what the
//! initiator sends next. It performs no I/O; the async driver feeds it replies
//! and executes the resulting [`Step`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::constants::PROTOCOL_VERSION;
use crate::core::{FrameError, ProtocolError, SessionConfig};
use crate::session::{Arrival, SessionState};
use crate::transport::{Frame, FrameType, Reassembler, SessionParams, next_sequence, split};

/// Outcome of one exchange.
#[derive(Debug)]
pub enum Step {
    /// Exchange this frame next.
    Continue(Frame),
    /// Resend the last sequenced frame, byte-for-byte.
    Retransmit(Frame),
    /// The reply is complete.
    Complete(Vec<u8>),
    /// The session must be torn down.
    Fatal(ProtocolError),
}

/// Result of the SESSION_ID handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Counters and buffers were reset.
    Fresh,
    /// The previous session continues where it stopped.
    Resumed,
}

/// Sequence, fragment and polling state of an initiator session.
#[derive(Debug)]
pub struct InitiatorMachine {
    session: SessionState,
    max_frame_size: usize,
    polling_timeout: Duration,
    /// Request fragments not yet sent.
    outgoing: VecDeque<Frame>,
    /// Response fragments received so far.
    reassembler: Reassembler,
    /// A transceive is in progress.
    in_flight: bool,
    /// The frame just sent was a retransmit request.
    requested_retransmit: bool,
    /// The peer acknowledged the last request fragment.
    delivered: bool,
    /// MessageSent has not been reported yet.
    delivery_pending: bool,
    /// REQUEST flag of the last polling frame.
    poll_flag: bool,
    /// When the peer first asked us to poll.
    polling_since: Option<Instant>,
}

impl InitiatorMachine {
    /// Create a fresh session.
    pub fn new(session_id: u64, config: &SessionConfig, max_frame_size: usize) -> Self {
        Self {
            session: SessionState::new(session_id, config.max_retransmits),
            max_frame_size,
            polling_timeout: config.polling_timeout,
            outgoing: VecDeque::new(),
            reassembler: Reassembler::new(),
            in_flight: false,
            requested_retransmit: false,
            delivered: false,
            delivery_pending: false,
            poll_flag: false,
            polling_since: None,
        }
    }

    /// Get the session bookkeeping.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Negotiated frame size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Check if a transceive was interrupted or is in progress.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// SESSION_ID parameters for this session.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            session_id: self.session.session_id(),
            max_frame_size: u16::try_from(self.max_frame_size).unwrap_or(u16::MAX),
        }
    }

    /// Start a transceive, returning the first frame to send.
    pub fn begin(&mut self, payload: &[u8]) -> Frame {
        self.clear_exchange();
        self.outgoing = split(payload, self.max_frame_size).into();
        self.in_flight = true;
        self.delivery_pending = true;
        tracing::debug!(
            len = payload.len(),
            fragments = self.outgoing.len(),
            "initiator: transceive started"
        );
        self.next_fragment()
    }

    /// Frame to resend after a resumed handshake.
    pub fn resume_frame(&self) -> Option<Frame> {
        if !self.in_flight {
            return None;
        }
        self.session.last_frame_sent().cloned()
    }

    /// Interpret the peer's reply and decide the next step.
    pub fn on_reply(&mut self, reply: Result<Frame, FrameError>, now: Instant) -> Step {
        let frame = match reply {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "initiator: corrupt reply");
                return self.request_retransmit(ProtocolError::CorruptFrame(e));
            }
        };

        if frame.version > PROTOCOL_VERSION {
            return Step::Fatal(ProtocolError::VersionIncompatible {
                supported: PROTOCOL_VERSION,
                received: frame.version,
            });
        }

        match frame.frame_type {
            FrameType::Retransmit => return self.on_retransmit_request(),
            FrameType::Error => {
                return Step::Fatal(ProtocolError::PeerError(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                ));
            }
            _ => {}
        }

        if let Err(e) = frame.check_size(self.max_frame_size) {
            tracing::warn!(error = %e, "initiator: oversized reply");
            return self.request_retransmit(ProtocolError::CorruptFrame(e));
        }

        match self.session.classify(frame.sequence) {
            Arrival::InOrder => self.session.accept(frame.sequence),
            Arrival::Repeat => {
                let expected = next_sequence(frame.sequence);
                return self.request_retransmit(ProtocolError::SequenceMismatch {
                    expected,
                    actual: frame.sequence,
                });
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
            "initiator: reply accepted"
        );

        match frame.frame_type {
            FrameType::GetNextFragment => {
                if self.outgoing.is_empty() {
                    return unexpected(&frame, "no request fragments left");
                }
                Step::Continue(self.next_fragment())
            }
            FrameType::Polling => {
                if !self.outgoing.is_empty() {
                    return unexpected(&frame, "request fragments still queued");
                }
                self.delivered = true;
                let since = *self.polling_since.get_or_insert(now);
                if now.duration_since(since) > self.polling_timeout {
                    return Step::Fatal(ProtocolError::ConnectionLost(format!(
                        "no deferred response within {:?}",
                        self.polling_timeout
                    )));
                }
                self.poll_flag = !self.poll_flag;
                Step::Continue(self.session.stamp(Frame::polling(self.poll_flag)))
            }
            FrameType::Default => {
                if !self.outgoing.is_empty() {
                    return unexpected(&frame, "request fragments still queued");
                }
                self.delivered = true;
                self.polling_since = None;
                if let Err(e) = self.reassembler.reassemble(&frame) {
                    return Step::Fatal(e);
                }
                if self.reassembler.is_complete() {
                    Step::Complete(self.reassembler.take())
                } else {
                    Step::Continue(self.session.stamp(request(Frame::get_next_fragment())))
                }
            }
            _ => unexpected(&frame, "exchanging data"),
        }
    }

    /// Report (once) that the peer has received the whole request.
    pub fn take_delivered(&mut self) -> bool {
        if self.delivered && self.delivery_pending {
            self.delivery_pending = false;
            true
        } else {
            false
        }
    }

    /// Reset per-transceive state, keeping the session.
    pub fn finish(&mut self) {
        self.clear_exchange();
    }

    fn clear_exchange(&mut self) {
        self.outgoing.clear();
        self.reassembler.clear();
        self.in_flight = false;
        self.requested_retransmit = false;
        self.delivered = false;
        self.delivery_pending = false;
        self.poll_flag = false;
        self.polling_since = None;
    }

    fn next_fragment(&mut self) -> Frame {
        let frame = self.outgoing.pop_front().unwrap_or_else(|| Frame::data(Vec::new()));
        self.session.stamp(request(frame))
    }

    /// The peer asked us to resend our last frame.
    fn on_retransmit_request(&mut self) -> Step {
        if self.requested_retransmit {
            return Step::Fatal(ProtocolError::DeadlockRetransmit);
        }
        if let Err(e) = self.session.record_resend() {
            return Step::Fatal(e);
        }
        match self.session.last_frame_sent() {
            Some(frame) => {
                tracing::warn!(
                    seq = frame.sequence,
                    attempt = self.session.resend_count(),
                    "initiator: peer requested retransmit"
                );
                Step::Retransmit(frame.clone())
            }
            None => Step::Fatal(ProtocolError::UnexpectedFrame {
                frame_type: FrameType::Retransmit,
                state: "nothing sent yet",
            }),
        }
    }

    /// Ask the peer to resend its last frame.
    fn request_retransmit(&mut self, cause: ProtocolError) -> Step {
        if let Err(e) = self.session.record_request() {
            tracing::error!(cause = %cause, "initiator: retransmit limit reached");
            return Step::Fatal(e);
        }
        tracing::warn!(
            cause = %cause,
            attempt = self.session.request_count(),
            "initiator: requesting retransmit"
        );
        self.requested_retransmit = true;
        Step::Continue(
            request(Frame::retransmit()).with_sequence(self.session.control_sequence()),
        )
    }
}

/// Mark a frame as sent by the initiator, keeping its other flags.
fn request(frame: Frame) -> Frame {
    let flags = frame.flags.with_request(true);
    frame.with_flags(flags)
}

fn unexpected(frame: &Frame, state: &'static str) -> Step {
    Step::Fatal(ProtocolError::UnexpectedFrame {
        frame_type: frame.frame_type,
        state,
    })
}

/// Interpret the reply to a SESSION_ID request.
pub fn handshake_outcome(reply: &Frame, requested_resume: bool) -> Result<Handshake, ProtocolError> {
    if reply.frame_type != FrameType::SessionId {
        return Err(ProtocolError::HandshakeFailed(format!(
            "expected SESSION_ID reply, got {:?}",
            reply.frame_type
        )));
    }
    match (requested_resume, reply.flags.is_resume()) {
        (true, true) => Ok(Handshake::Resumed),
        (_, false) => Ok(Handshake::Fresh),
        (false, true) => Err(ProtocolError::HandshakeFailed(
            "peer resumed a session we did not offer".into(),
        )),
    }
}

/// Interpret the reply to the channel-select command.
pub fn check_select_ack(reply: &Frame) -> Result<(), ProtocolError> {
    if reply.version > PROTOCOL_VERSION {
        return Err(ProtocolError::VersionIncompatible {
            supported: PROTOCOL_VERSION,
            received: reply.version,
        });
    }
    if reply.frame_type != FrameType::ChannelSelect || reply.flags.is_request() {
        return Err(ProtocolError::HandshakeFailed(format!(
            "expected select acknowledgement, got {:?}",
            reply.frame_type
        )));
    }
    Ok(())
}
