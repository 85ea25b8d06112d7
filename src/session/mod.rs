//! NEARLINK Protocol - Session Layer
//!
//! Implements:
//! - Sequence bookkeeping and bounded retransmission ([`SessionState`])
//! - The inactivity [`Watchdog`] that detects silent link death
//! - Application events ([`SessionEvent`])

mod event;
mod state;
mod watchdog;

pub use event::*;
pub use state::*;
pub use watchdog::Watchdog;
