//! Per-session sequence and retransmission state.
//!
//! Both roles keep the same bookkeeping: the last sequence number sent and
//! received, the last sequenced frame (so a retransmission is byte-identical to
//! the original) and the retransmit counters for the current exchange.
//!
//! Resending our own frame and asking the peer to resend theirs are counted
//! separately: a glitch in each direction of one exchange is two independent
//! repairs, each bounded by `max_retransmits`.

use crate::core::constants::INITIAL_SEQUENCE;
use crate::core::{ProtocolError, Result};
use crate::transport::{Frame, next_sequence};

/// Where an inbound sequence number falls relative to the last one received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The successor of the last received sequence.
    InOrder,
    /// The last received sequence again: the peer never saw our reply.
    Repeat,
    /// Anything else.
    OutOfOrder {
        /// The sequence number that would have been in order.
        expected: u8,
    },
}

/// Session bookkeeping shared by the initiator and the responder.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Identity of the conversation.
    session_id: u64,
    /// Last sequence number we sent.
    last_sequence_sent: u8,
    /// Last sequence number we accepted.
    last_sequence_received: u8,
    /// Last sequenced frame we sent, kept for verbatim retransmission.
    last_frame_sent: Option<Frame>,
    /// Times we resent our last frame in the current exchange.
    resend_count: u32,
    /// Times we asked the peer to resend in the current exchange.
    request_count: u32,
    /// Retransmission bound.
    max_retransmits: u32,
}

impl SessionState {
    /// Create a fresh session.
    pub fn new(session_id: u64, max_retransmits: u32) -> Self {
        Self {
            session_id,
            last_sequence_sent: INITIAL_SEQUENCE,
            last_sequence_received: INITIAL_SEQUENCE,
            last_frame_sent: None,
            resend_count: 0,
            request_count: 0,
            max_retransmits,
        }
    }

    /// Get the session identifier.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Get the last sequence number sent.
    pub fn last_sequence_sent(&self) -> u8 {
        self.last_sequence_sent
    }

    /// Get the last sequence number accepted.
    pub fn last_sequence_received(&self) -> u8 {
        self.last_sequence_received
    }

    /// Get the last sequenced frame sent.
    pub fn last_frame_sent(&self) -> Option<&Frame> {
        self.last_frame_sent.as_ref()
    }

    /// Get how often our last frame was resent in the current exchange.
    pub fn resend_count(&self) -> u32 {
        self.resend_count
    }

    /// Get how often the peer was asked to resend in the current exchange.
    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Assign the next sequence number to `frame` and remember it.
    pub fn stamp(&mut self, frame: Frame) -> Frame {
        let sequence = next_sequence(self.last_sequence_sent);
        let frame = frame.with_sequence(sequence);
        self.last_sequence_sent = sequence;
        self.last_frame_sent = Some(frame.clone());
        frame
    }

    /// Sequence number carried by control replies, which do not consume one.
    pub fn control_sequence(&self) -> u8 {
        next_sequence(self.last_sequence_sent)
    }

    /// Classify an inbound sequence number.
    pub fn classify(&self, sequence: u8) -> Arrival {
        let expected = next_sequence(self.last_sequence_received);
        if sequence == expected {
            Arrival::InOrder
        } else if sequence == self.last_sequence_received && self.last_frame_sent.is_some() {
            Arrival::Repeat
        } else {
            Arrival::OutOfOrder { expected }
        }
    }

    /// Accept an in-order sequence number, closing the current exchange.
    pub fn accept(&mut self, sequence: u8) {
        self.last_sequence_received = sequence;
        self.resend_count = 0;
        self.request_count = 0;
    }

    /// Count one resend of our last frame against the bound.
    ///
    /// Returns [`ProtocolError::RetransmitExhausted`] once the bound is spent.
    pub fn record_resend(&mut self) -> Result<u32> {
        bump(&mut self.resend_count, self.max_retransmits)
    }

    /// Count one retransmit request to the peer against the bound.
    ///
    /// Returns [`ProtocolError::RetransmitExhausted`] once the bound is spent.
    pub fn record_request(&mut self) -> Result<u32> {
        bump(&mut self.request_count, self.max_retransmits)
    }

    /// Restart the session with counters at zero and nothing buffered.
    pub fn reset(&mut self, session_id: u64) {
        *self = Self::new(session_id, self.max_retransmits);
    }
}

fn bump(count: &mut u32, max: u32) -> Result<u32> {
    if *count >= max {
        return Err(ProtocolError::RetransmitExhausted { attempts: *count });
    }
    *count += 1;
    Ok(*count)
}
