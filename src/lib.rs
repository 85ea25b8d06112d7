//! # NEARLINK Protocol
//!
//! **N**ear-field **E**xchange **A**nd **R**eliable **LINK**
//!
//! NEARLINK carries arbitrary byte payloads over a half-duplex
//! request/response link such as an NFC reader talking to an emulated card.
//! Each physical exchange is one command and one reply of a bounded size; on
//! top of that NEARLINK provides:
//!
//! - **Fragmentation**: payloads of any size are split into frame runs and
//!   reassembled on the other side
//! - **Ordering**: every frame carries a sequence number; gaps and repeats are
//!   detected and repaired with bounded retransmission
//! - **Resumption**: a link that drops for less than the resume window
//!   continues the same session instead of starting over
//! - **Deferred replies**: a responder can answer later while the initiator
//!   polls
//!
//! ## Feature Flags
//!
//! - `session`: Watchdog, sequence state and events (pulls in `tokio`)
//! - `initiator` (default): Reader-side state machine
//! - `responder` (default): Card-side state machine
//!
//! ## Modules
//!
//! - [`core`]: Constants, errors, configuration and collaborator traits (always included)
//! - [`transport`]: Frame codec, sequence arithmetic and fragment engine (always included)
//! - [`session`]: Session state, watchdog and events (requires `session` feature)
//! - [`initiator`]: Reader side (requires `initiator` feature)
//! - [`responder`]: Card side (requires `responder` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use nearlink::prelude::*;
//!
//! let fragments = split(&[1, 2, 3, 4, 5, 6, 7, 8], 5);
//! assert_eq!(fragments.len(), 3);
//!
//! let mut reassembler = Reassembler::new();
//! for (i, fragment) in fragments.into_iter().enumerate() {
//!     let frame = fragment.with_sequence(i as u8 + 1);
//!     let bytes = frame.encode();
//!     reassembler.reassemble(&Frame::decode(&bytes).unwrap()).unwrap();
//! }
//! assert_eq!(reassembler.take(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire format (always included)
pub mod transport;

// Session layer (feature-gated)
#[cfg(feature = "session")]
#[cfg_attr(docsrs, doc(cfg(feature = "session")))]
pub mod session;

// Reader side (feature-gated)
#[cfg(feature = "initiator")]
#[cfg_attr(docsrs, doc(cfg(feature = "initiator")))]
pub mod initiator;

// Card side (feature-gated)
#[cfg(feature = "responder")]
#[cfg_attr(docsrs, doc(cfg(feature = "responder")))]
pub mod responder;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    // Wire format
    pub use crate::transport::{
        Frame, FrameFlags, FrameType, Reassembler, SessionParams, fragment_count, next_sequence,
        split,
    };

    #[cfg(feature = "session")]
    pub use crate::session::{EventStream, SessionEvent, Watchdog};

    #[cfg(feature = "initiator")]
    pub use crate::initiator::{Handshake, Initiator, InitiatorPhase};

    #[cfg(feature = "responder")]
    pub use crate::responder::{DeactivationReason, Responder};
}

// Re-export commonly used items at crate root
pub use crate::core::{Channel, ErrorKind, ProtocolError, RequestHandler, Result, SessionConfig};

pub use crate::transport::{Frame, FrameType};

#[cfg(feature = "initiator")]
pub use crate::initiator::Initiator;

#[cfg(feature = "responder")]
pub use crate::responder::Responder;
