//! Cross-process transport: connection primitives plus the ordered,
//! strongly-typed serialization buffer used for every exchange.

pub mod message;
pub mod socket;

pub use message::{Message, OpCode, SandboxCode, WireField};
pub use socket::{Connection, Endpoint};
