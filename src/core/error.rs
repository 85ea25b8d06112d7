//! Error types for the NEARLINK protocol engine.

use std::io;

use thiserror::Error;

use crate::transport::FrameType;

/// Errors that can occur when decoding or encoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer is too short to hold a frame header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Payload does not fit in a frame of the negotiated size.
    #[error("payload of {size} bytes exceeds frame capacity of {max} bytes")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },
}

/// Discriminant of a [`ProtocolError`], cheap to copy into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Too-short or malformed bytes.
    CorruptFrame,
    /// Out-of-order sequence number.
    SequenceMismatch,
    /// Retransmission bound exceeded.
    RetransmitExhausted,
    /// Both peers requested retransmission in the same round.
    DeadlockRetransmit,
    /// Peer speaks a newer protocol version.
    VersionIncompatible,
    /// Handshake could not be completed.
    HandshakeFailed,
    /// Channel I/O failed.
    ChannelIo,
    /// Link declared dead.
    ConnectionLost,
    /// Peer reported a fatal error.
    PeerError,
    /// Frame type not valid in the current state.
    UnexpectedFrame,
    /// API misuse (empty payload, no session, bad configuration).
    Usage,
}

/// Errors produced by the initiator and responder state machines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Received bytes could not be decoded.
    #[error("corrupt frame: {0}")]
    CorruptFrame(#[from] FrameError),

    /// Frame arrived out of order.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Expected sequence number.
        expected: u8,
        /// Received sequence number.
        actual: u8,
    },

    /// Too many retransmissions for a single exchange.
    #[error("retransmit limit exhausted after {attempts} attempts")]
    RetransmitExhausted {
        /// Number of retransmissions performed.
        attempts: u32,
    },

    /// Both peers asked each other to retransmit the same exchange.
    #[error("retransmit deadlock: both peers requested retransmission")]
    DeadlockRetransmit,

    /// Peer uses a protocol version we do not support.
    #[error("incompatible protocol version: supported {supported}, received {received}")]
    VersionIncompatible {
        /// Highest version we support.
        supported: u8,
        /// Version announced by the peer.
        received: u8,
    },

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Channel I/O error. Possibly transient; the session may be resumed.
    #[error("channel i/o error: {0}")]
    ChannelIo(#[from] io::Error),

    /// Link declared dead by the watchdog or an exchange timeout.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Peer sent an ERROR frame.
    #[error("peer error: {0}")]
    PeerError(String),

    /// Frame type is not valid in the current protocol state.
    #[error("unexpected {frame_type:?} frame while {state}")]
    UnexpectedFrame {
        /// Type of the offending frame.
        frame_type: FrameType,
        /// What the state machine was doing.
        state: &'static str,
    },

    /// Empty payloads cannot be transceived.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// No channel bound or no active session.
    #[error("not connected")]
    NotConnected,

    /// An interrupted exchange must be resumed before a new one starts.
    #[error("an interrupted exchange is pending; resume it first")]
    ExchangePending,

    /// `send_later` called while no request is waiting for a response.
    #[error("no request is waiting for a deferred response")]
    NoDeferredRequest,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Get the error discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::CorruptFrame(_) => ErrorKind::CorruptFrame,
            ProtocolError::SequenceMismatch { .. } => ErrorKind::SequenceMismatch,
            ProtocolError::RetransmitExhausted { .. } => ErrorKind::RetransmitExhausted,
            ProtocolError::DeadlockRetransmit => ErrorKind::DeadlockRetransmit,
            ProtocolError::VersionIncompatible { .. } => ErrorKind::VersionIncompatible,
            ProtocolError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            ProtocolError::ChannelIo(_) => ErrorKind::ChannelIo,
            ProtocolError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            ProtocolError::PeerError(_) => ErrorKind::PeerError,
            ProtocolError::UnexpectedFrame { .. } => ErrorKind::UnexpectedFrame,
            ProtocolError::EmptyPayload
            | ProtocolError::NotConnected
            | ProtocolError::ExchangePending
            | ProtocolError::NoDeferredRequest
            | ProtocolError::Config(_) => ErrorKind::Usage,
        }
    }

    /// Check if this error is handled inside the state machine by a retransmit request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::CorruptFrame(_) | ProtocolError::SequenceMismatch { .. }
        )
    }

    /// Check if this error leaves the session resumable.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::ChannelIo(_))
    }

    /// Check if this error tears the session down.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable() && !self.is_transient() && self.kind() != ErrorKind::Usage
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
