//! Ordered, strongly-typed serialization buffer.
//!
//! A [`Message`] is an append-only byte buffer with a write cursor and a
//! read cursor. Fields are pushed and popped in a fixed agreed order per
//! opcode; writer and reader must agree on the exact field sequence. There
//! is no type tagging on the wire — this is a contract, not a
//! self-describing format.

use crate::types::{Counter, MemoryUsage, NetworkUsage, ResourceSnapshot, RigError, Status};
use crate::types::Result;

/// Control-plane opcodes exchanged between driver and workers.
///
/// Field layouts: `WorkerStarted(id: u32, address: String)`,
/// `RunTest(module: String, name: String)`,
/// `FinishedTest(id: u32, status: Status, report: String)`,
/// `Notify(id: u32)` worker-to-driver / no payload driver-to-worker,
/// `Terminate` no payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    WorkerStarted,
    RunTest,
    FinishedTest,
    Notify,
    Terminate,
}

impl OpCode {
    fn to_wire(self) -> u8 {
        match self {
            OpCode::WorkerStarted => 0,
            OpCode::RunTest => 1,
            OpCode::FinishedTest => 2,
            OpCode::Notify => 3,
            OpCode::Terminate => 4,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        Ok(match value {
            0 => OpCode::WorkerStarted,
            1 => OpCode::RunTest,
            2 => OpCode::FinishedTest,
            3 => OpCode::Notify,
            4 => OpCode::Terminate,
            other => return Err(RigError::Protocol(format!("unknown opcode: {}", other))),
        })
    }
}

/// Result codes for the sandbox parent/child protocol.
///
/// Field layouts: `Complete(status, snapshot, errors, init_time, body_time,
/// complete_time [, baseline_time])`, `Error(reason: String)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxCode {
    Complete,
    Error,
}

impl SandboxCode {
    fn to_wire(self) -> u8 {
        match self {
            SandboxCode::Complete => 0,
            SandboxCode::Error => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        Ok(match value {
            0 => SandboxCode::Complete,
            1 => SandboxCode::Error,
            other => {
                return Err(RigError::Protocol(format!(
                    "unknown sandbox code: {}",
                    other
                )))
            }
        })
    }
}

/// A field that knows how to append itself to and extract itself from a
/// [`Message`] buffer. Integers are little-endian fixed width; strings and
/// lists are length-prefixed.
pub trait WireField: Sized {
    fn put(&self, message: &mut Message);
    fn get(message: &mut Message) -> Result<Self>;
}

/// Serialization buffer for every cross-process exchange.
#[derive(Default, Clone, Debug)]
pub struct Message {
    buf: Vec<u8>,
    cursor: usize,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Chainable so call sites read like the wire layout.
    pub fn put<T: WireField>(&mut self, value: &T) -> &mut Self {
        value.put(self);
        self
    }

    /// Extract the next field, which must have been written as a `T`.
    pub fn get<T: WireField>(&mut self) -> Result<T> {
        T::get(self)
    }

    /// True while unread fields remain behind the read cursor.
    pub fn has_data(&self) -> bool {
        self.cursor < self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn from_payload(payload: Vec<u8>) -> Self {
        Self {
            buf: payload,
            cursor: 0,
        }
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn take_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if self.buf.len() - self.cursor < n {
            return Err(RigError::Protocol(format!(
                "message underflow: wanted {} bytes, {} remain",
                n,
                self.buf.len() - self.cursor
            )));
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }
}

macro_rules! integer_wire_field {
    ($($ty:ty),*) => {
        $(
            impl WireField for $ty {
                fn put(&self, message: &mut Message) {
                    message.push_bytes(&self.to_le_bytes());
                }

                fn get(message: &mut Message) -> Result<Self> {
                    let bytes = message.take_bytes(std::mem::size_of::<$ty>())?;
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

integer_wire_field!(u8, u16, u32, u64, f64);

impl WireField for String {
    fn put(&self, message: &mut Message) {
        (self.len() as u32).put(message);
        message.push_bytes(self.as_bytes());
    }

    fn get(message: &mut Message) -> Result<Self> {
        let len = u32::get(message)? as usize;
        let bytes = message.take_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RigError::Protocol(format!("invalid utf-8 string field: {}", e)))
    }
}

impl WireField for Vec<String> {
    fn put(&self, message: &mut Message) {
        (self.len() as u32).put(message);
        for item in self {
            item.put(message);
        }
    }

    fn get(message: &mut Message) -> Result<Self> {
        let len = u32::get(message)? as usize;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(String::get(message)?);
        }
        Ok(items)
    }
}

impl WireField for Counter {
    fn put(&self, message: &mut Message) {
        message.put(&self.size).put(&self.count);
    }

    fn get(message: &mut Message) -> Result<Self> {
        Ok(Counter {
            size: message.get()?,
            count: message.get()?,
        })
    }
}

impl WireField for ResourceSnapshot {
    fn put(&self, message: &mut Message) {
        message
            .put(&self.memory.allocate)
            .put(&self.memory.deallocate)
            .put(&self.memory.max)
            .put(&self.network.send)
            .put(&self.network.receive);
    }

    fn get(message: &mut Message) -> Result<Self> {
        Ok(ResourceSnapshot {
            memory: MemoryUsage {
                allocate: message.get()?,
                deallocate: message.get()?,
                max: message.get()?,
            },
            network: NetworkUsage {
                send: message.get()?,
                receive: message.get()?,
            },
        })
    }
}

impl WireField for Status {
    fn put(&self, message: &mut Message) {
        self.to_wire().put(message);
    }

    fn get(message: &mut Message) -> Result<Self> {
        Status::from_wire(u8::get(message)?)
    }
}

impl WireField for OpCode {
    fn put(&self, message: &mut Message) {
        self.to_wire().put(message);
    }

    fn get(message: &mut Message) -> Result<Self> {
        OpCode::from_wire(u8::get(message)?)
    }
}

impl WireField for SandboxCode {
    fn put(&self, message: &mut Message) {
        self.to_wire().put(message);
    }

    fn get(message: &mut Message) -> Result<Self> {
        SandboxCode::from_wire(u8::get(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Counter;

    #[test]
    fn roundtrip_preserves_field_order_and_values() {
        let snapshot = ResourceSnapshot {
            memory: MemoryUsage {
                allocate: Counter { size: 4096, count: 3 },
                deallocate: Counter { size: 4096, count: 3 },
                max: Counter { size: 2048, count: 2 },
            },
            network: NetworkUsage {
                send: Counter { size: 17, count: 1 },
                receive: Counter { size: 0, count: 0 },
            },
        };
        let errors = vec!["first error".to_string(), "second error".to_string()];

        let mut m = Message::new();
        m.put(&SandboxCode::Complete)
            .put(&Status::PassWithMemoryLeak)
            .put(&snapshot)
            .put(&errors)
            .put(&123_456_789u64)
            .put(&0.25f64);

        assert_eq!(m.get::<SandboxCode>().unwrap(), SandboxCode::Complete);
        assert_eq!(m.get::<Status>().unwrap(), Status::PassWithMemoryLeak);
        assert_eq!(m.get::<ResourceSnapshot>().unwrap(), snapshot);
        assert_eq!(m.get::<Vec<String>>().unwrap(), errors);
        assert_eq!(m.get::<u64>().unwrap(), 123_456_789u64);
        assert_eq!(m.get::<f64>().unwrap(), 0.25f64);
        assert!(!m.has_data());
    }

    #[test]
    fn reading_past_the_end_is_a_protocol_error() {
        let mut m = Message::new();
        m.put(&7u32);
        let _ = m.get::<u32>().unwrap();
        assert!(m.get::<u64>().is_err());
    }

    #[test]
    fn reader_must_know_the_layout() {
        // A u64 written as two u32 reads yields the halves, not an error:
        // the buffer carries no type tags by design.
        let mut m = Message::new();
        m.put(&0x0000_0002_0000_0001u64);
        assert_eq!(m.get::<u32>().unwrap(), 1);
        assert_eq!(m.get::<u32>().unwrap(), 2);
    }

    #[test]
    fn opcode_rejects_unknown_bytes() {
        let mut m = Message::from_payload(vec![9]);
        assert!(m.get::<OpCode>().is_err());
    }

    #[test]
    fn empty_message_has_no_data() {
        let m = Message::new();
        assert!(!m.has_data());
        assert!(m.is_empty());
    }
}
