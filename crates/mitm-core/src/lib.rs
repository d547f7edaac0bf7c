//! Protocol primitives for the game relay: record decoding, packet injection
//! queues and the retrying hack automaton.
//!
//! Nothing in this crate touches a socket. The proxy crate owns the network
//! side and drives these types once per received buffer.

pub mod decoder;
pub mod error;
pub mod hack;
pub mod hex;
pub mod injection;
pub mod protocol;

pub use decoder::{DecodeEvent, Decoded, Decoder, PartialDecode, UnrecognizedRun};
pub use error::{DecodeError, TableError};
pub use hack::{HackEngine, HackKind, HackOutcome, HackPhase, HackSpec, HackStatus};
pub use injection::{InjectionEntry, InjectionQueue};
pub use protocol::Direction;
