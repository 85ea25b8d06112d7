//! Protocol constants for the NEARLINK wire format.
//!
//! These values are fixed by the protocol and MUST NOT be changed. Both peers
//! compare the control byte sequences bit-for-bit.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in the 2-bit version field of every generic frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Highest value representable in the version field.
pub const MAX_VERSION_FIELD: u8 = 0b11;

/// Generic frame header size (packed header byte + sequence number).
pub const HEADER_SIZE: usize = 2;

/// Largest sequence number that may appear on the wire.
///
/// 255 is reserved and never emitted.
pub const MAX_SEQUENCE: u8 = 254;

/// Sequence number of both counters at the start of a fresh session.
pub const INITIAL_SEQUENCE: u8 = 0;

// =============================================================================
// HEADER BIT LAYOUT (MSB first: type:3 | version:2 | resume | request | more)
// =============================================================================

/// Shift of the 3-bit frame type.
pub const TYPE_SHIFT: u8 = 5;

/// Shift of the 2-bit version field.
pub const VERSION_SHIFT: u8 = 3;

/// Session is being resumed.
pub const FLAG_RESUME: u8 = 0x04;

/// Frame is a request (as opposed to a response).
pub const FLAG_REQUEST: u8 = 0x02;

/// More fragments of the same run follow.
pub const FLAG_HAS_MORE_FRAGMENTS: u8 = 0x01;

/// Mask covering all three flag bits.
pub const FLAG_MASK: u8 = FLAG_RESUME | FLAG_REQUEST | FLAG_HAS_MORE_FRAGMENTS;

// =============================================================================
// CONTROL EXCHANGES (fixed byte sequences)
// =============================================================================

/// Application identifier selected by the initiator.
pub const APPLICATION_ID: [u8; 7] = [0xF0, 0x4E, 0x4C, 0x4E, 0x4B, 0x30, 0x31];

/// ISO 7816-4 SELECT-by-AID command opening the channel.
pub const SELECT_APDU: [u8; 13] = [
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xF0, 0x4E, 0x4C, 0x4E, 0x4B, 0x30, 0x31, 0x00,
];

/// Probe the reader injects while the link is idle.
pub const KEEP_ALIVE_PROBE: [u8; 5] = [0x00, 0xB0, 0x00, 0x00, 0x00];

// =============================================================================
// SESSION HANDSHAKE
// =============================================================================

/// SESSION_ID payload size (u64 session id + u16 max frame size, big-endian).
pub const SESSION_ID_PAYLOAD_SIZE: usize = 8 + 2;

// =============================================================================
// FRAME SIZES
// =============================================================================

/// Default maximum frame size (fits a short APDU with room for the status word).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 245;

/// Upper bound for a negotiated frame size (carried as u16 on the wire).
pub const MAX_FRAME_SIZE_LIMIT: usize = u16::MAX as usize;

/// Smallest frame size that still carries one payload byte.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Inactivity threshold after which a dropped session can no longer be resumed.
pub const DEFAULT_RESUME_THRESHOLD: Duration = Duration::from_millis(300);

/// Upper bound for a single channel exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the initiator keeps polling for a deferred response.
pub const DEFAULT_POLLING_TIMEOUT: Duration = Duration::from_secs(10);

/// Retransmissions allowed per exchange before the session is torn down.
pub const DEFAULT_MAX_RETRANSMITS: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_apdu_embeds_application_id() {
        assert_eq!(SELECT_APDU[4] as usize, APPLICATION_ID.len());
        assert_eq!(&SELECT_APDU[5..12], &APPLICATION_ID);
    }

    #[test]
    fn test_header_layout_is_disjoint() {
        let version_mask = MAX_VERSION_FIELD << VERSION_SHIFT;
        let type_mask = 0b111 << TYPE_SHIFT;
        assert_eq!(version_mask & FLAG_MASK, 0);
        assert_eq!(type_mask & FLAG_MASK, 0);
        assert_eq!(type_mask & version_mask, 0);
        assert_eq!(type_mask | version_mask | FLAG_MASK, 0xFF);
    }
}
