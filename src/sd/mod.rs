//! # Service Discovery
//!
//! SD messages are ordinary notifications on service `0xFFFF`, method
//! `0x8100`, whose payload is an [`SdPacket`]: a flags byte, an array of
//! 16-byte [`SdEntry`] values and an array of [`SdOption`] values the
//! entries point into.
//!
//! [`ServiceDiscovery`] runs the protocol on top of that: offers and finds
//! on the multicast group, per-key remote state with liveness deadlines,
//! and eventgroup subscribe/ack handshakes.

pub mod entries;
pub mod machine;
pub mod options;
pub mod packet;

pub use entries::*;
pub use machine::*;
pub use options::*;
pub use packet::*;

mod tests;
