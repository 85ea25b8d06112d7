//! NEARLINK Protocol - Responder
//!
//! The card side of a session. It never initiates an exchange: each inbound
//! frame is answered with exactly one reply, and complete requests are handed
//! to the application's [`RequestHandler`](crate::core::RequestHandler).

mod machine;
#[allow(clippy::module_inception)]
mod responder;

pub use machine::{DeactivationReason, Reply, ResponderMachine};
pub use responder::Responder;
