//! NEARLINK Protocol - Transport Layer
//!
//! This module implements the wire-level half of the protocol:
//!
//! - **Frame codec**: [`Frame`], [`FrameType`], [`FrameFlags`] and the fixed
//!   control byte sequences
//! - **Sequence arithmetic**: [`next_sequence`] shared by both peers
//! - **Fragment engine**: [`split`] and [`Reassembler`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Initiator / Responder machines      │
//! ├─────────────────────────────────────────┤
//! │            Session Layer                │
//! │   sequence state, watchdog, events      │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, sequences, fragments          │
//! ├─────────────────────────────────────────┤
//! │     Channel (reader / card emulation)   │
//! └─────────────────────────────────────────┘
//! ```

mod fragment;
mod frame;
mod sequence;

pub use fragment::{Reassembler, fragment_count, split};
pub use frame::*;
pub use sequence::*;
