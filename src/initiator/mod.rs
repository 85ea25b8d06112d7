//! NEARLINK Protocol - Initiator
//!
//! The reader side of a session. It owns the exchange loop: every frame it
//! sends is answered by exactly one frame from the responder.
//!
//! ```text
//! enable(channel)
//!   ├─ SELECT ──────────────► ack (version check)
//!   └─ SESSION_ID [RESUME?] ► ack [RESUME?]
//!
//! transceive(payload)
//!   ├─ DATA (more) ─────────► GET_NEXT_FRAGMENT
//!   ├─ DATA (last) ─────────► POLLING ... │ DATA (more)
//!   └─ GET_NEXT_FRAGMENT ───► DATA (last)
//! ```

#[allow(clippy::module_inception)]
mod initiator;
mod machine;

pub use initiator::{Initiator, InitiatorPhase};
pub use machine::{Handshake, InitiatorMachine, Step};
