//! Message Relay Module
//!
//! Broadcast fan-out and the per-connection session state machine.

pub mod broadcast;
pub mod session;

pub use broadcast::{BroadcastRelay, DeliveryReport};
pub use session::{SessionEnd, SessionHandler, SessionSettings};
