//! Sequence-number arithmetic.
//!
//! Sequence numbers advance modulo 255. After the handshake they cycle through
//! `1..=254`: 0 marks the start of a fresh session and 255 is never emitted, so a
//! wrapped counter cannot be confused with either.

use crate::core::constants::MAX_SEQUENCE;

/// Sequence number that follows `sequence`.
pub fn next_sequence(sequence: u8) -> u8 {
    if sequence >= MAX_SEQUENCE {
        1
    } else {
        sequence + 1
    }
}
