//! Byte-oriented connection primitives.
//!
//! [`Endpoint`] is the listening side: bind an ephemeral localhost port,
//! then repeatedly accept-or-poll with a timeout. [`Connection`] is the
//! connecting side. All traffic is length-prefixed [`Message`] frames.
//!
//! The sandbox parent waiting on its child, the driver waiting on workers,
//! and a worker waiting on the driver all suspend on the same primitive:
//! [`Endpoint::poll_or_accept`].

use crate::monitor;
use crate::transport::message::Message;
use crate::types::{Result, RigError};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

/// Sleep between poll sweeps.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A peer that opened a connection must deliver a started frame promptly;
/// a stalled partial frame is treated as a broken connection.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames beyond this size indicate a corrupt length prefix.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

enum FrameOutcome {
    NotReady,
    Frame(Message),
    Gone,
}

/// Listening endpoint that accepts connections and polls them for frames.
pub struct Endpoint {
    listener: TcpListener,
    connections: Vec<TcpStream>,
}

impl Endpoint {
    /// Bind and listen on an ephemeral localhost port.
    pub fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: Vec::new(),
        })
    }

    pub fn address(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait up to `timeout` for the next complete inbound message, accepting
    /// new connections as they arrive. Returns `None` on timeout.
    ///
    /// A connection that fails mid-read is dropped without disturbing the
    /// listener or its sibling connections.
    pub fn poll_or_accept(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.accept_pending()?;

            let mut index = 0;
            while index < self.connections.len() {
                match read_frame(&mut self.connections[index]) {
                    Ok(FrameOutcome::Frame(message)) => {
                        monitor::network().record_recv(message.len() as u64);
                        return Ok(Some(message));
                    }
                    Ok(FrameOutcome::NotReady) => index += 1,
                    Ok(FrameOutcome::Gone) | Err(_) => {
                        // Dispose: the peer closed or the frame was corrupt.
                        let stream = self.connections.swap_remove(index);
                        drop(stream);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    stream.set_nonblocking(true)?;
                    self.connections.push(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Probe a nonblocking stream and, if bytes are waiting, read one complete
/// frame. The sender always writes whole frames, so a blocking read with a
/// bounded timeout finishes the frame once its first byte is visible.
fn read_frame(stream: &mut TcpStream) -> Result<FrameOutcome> {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe) {
        Ok(0) => return Ok(FrameOutcome::Gone),
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FrameOutcome::NotReady),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(FrameOutcome::NotReady),
        Err(e) => return Err(e.into()),
    }

    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(FRAME_READ_TIMEOUT))?;
    let result = read_frame_blocking(stream);
    stream.set_nonblocking(true)?;
    result.map(FrameOutcome::Frame)
}

fn read_frame_blocking(stream: &mut TcpStream) -> Result<Message> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(RigError::Transport(format!(
            "frame length {} exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Message::from_payload(payload))
}

/// Client side of a transport link.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Connect to a previously obtained endpoint address.
    pub fn connect(address: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| RigError::Transport(format!("connect {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }

    /// Send one message as a length-prefixed frame.
    ///
    /// While tracking is active the attempt is subject to fault injection
    /// and, on success, counted by the network tracker. Engine-internal
    /// sends run under the reentrancy guard and pass untouched.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let tracker = monitor::network();
        if tracker.should_drop_send() {
            return Err(RigError::FaultInjected);
        }
        let len = message.payload().len() as u32;
        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(message.payload())?;
        self.stream.flush()?;
        tracker.record_send(message.payload().len() as u64);
        Ok(())
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Explicitly close the link. Dropping has the same effect.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::OpCode;

    #[test]
    fn endpoint_binds_an_ephemeral_port() {
        let endpoint = Endpoint::bind().unwrap();
        assert_ne!(endpoint.address().unwrap().port(), 0);
    }

    #[test]
    fn poll_times_out_with_no_traffic() {
        let mut endpoint = Endpoint::bind().unwrap();
        let polled = endpoint
            .poll_or_accept(Duration::from_millis(20))
            .unwrap();
        assert!(polled.is_none());
    }

    #[test]
    fn frames_cross_a_connection_in_order() {
        let _serial = crate::monitor::test_guard();
        crate::monitor::force_disable();
        let mut endpoint = Endpoint::bind().unwrap();
        let mut conn = Connection::connect(endpoint.address().unwrap()).unwrap();

        let mut first = Message::new();
        first.put(&OpCode::Notify).put(&3u32);
        conn.send(&first).unwrap();

        let mut second = Message::new();
        second.put(&OpCode::FinishedTest).put(&7u32);
        conn.send(&second).unwrap();

        let mut received = endpoint
            .poll_or_accept(Duration::from_secs(2))
            .unwrap()
            .expect("first frame");
        assert_eq!(received.get::<OpCode>().unwrap(), OpCode::Notify);
        assert_eq!(received.get::<u32>().unwrap(), 3);

        let mut received = endpoint
            .poll_or_accept(Duration::from_secs(2))
            .unwrap()
            .expect("second frame");
        assert_eq!(received.get::<OpCode>().unwrap(), OpCode::FinishedTest);
        assert_eq!(received.get::<u32>().unwrap(), 7);
    }

    #[test]
    fn closed_connection_is_disposed_without_killing_the_listener() {
        let _serial = crate::monitor::test_guard();
        crate::monitor::force_disable();
        let mut endpoint = Endpoint::bind().unwrap();
        {
            let conn = Connection::connect(endpoint.address().unwrap()).unwrap();
            conn.close();
        }
        // The disposed connection surfaces as a timeout, not an error.
        let polled = endpoint
            .poll_or_accept(Duration::from_millis(50))
            .unwrap();
        assert!(polled.is_none());

        // The listener still accepts new traffic afterwards.
        let mut conn = Connection::connect(endpoint.address().unwrap()).unwrap();
        let mut m = Message::new();
        m.put(&OpCode::Terminate);
        conn.send(&m).unwrap();
        let mut received = endpoint
            .poll_or_accept(Duration::from_secs(2))
            .unwrap()
            .expect("frame after disposal");
        assert_eq!(received.get::<OpCode>().unwrap(), OpCode::Terminate);
    }
}
