//! Runtime side of the link, for tests, demos and headless runtimes.
//!
//! Outgoing text goes through the inverse shift of [`crate::frame`];
//! incoming controller tokens arrive as plain UTF-8 with no delimiter, so
//! `wait_for` scans the accumulated stream for the token it wants.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::Result;
use crate::frame::encode_frame;

const READ_SLICE: Duration = Duration::from_millis(20);

pub struct RuntimeClient {
    stream: TcpStream,
    inbox: String,
    terminate_frames: bool,
}

impl RuntimeClient {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbox: String::new(),
            terminate_frames: false,
        })
    }

    /// Append the wire terminator byte to every sent message.
    pub fn with_terminated_frames(mut self, enabled: bool) -> Self {
        self.terminate_frames = enabled;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn send(&mut self, message: &str) -> Result<()> {
        let wire = encode_frame(message, self.terminate_frames)?;
        self.stream.write_all(&wire)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Wait until `token` shows up in the controller's stream and consume
    /// everything up to and including it. Returns false on timeout or when
    /// the controller closed the connection first.
    pub fn wait_for(&mut self, token: &str, timeout: Duration) -> io::Result<bool> {
        Ok(self.wait_for_any(&[token], timeout)?.is_some())
    }

    /// Like [`wait_for`](Self::wait_for) for several candidates; yields the
    /// index of whichever token appears first in the stream.
    pub fn wait_for_any(&mut self, tokens: &[&str], timeout: Duration) -> io::Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            let earliest = tokens
                .iter()
                .enumerate()
                .filter_map(|(idx, token)| self.inbox.find(token).map(|pos| (pos, idx)))
                .min();
            if let Some((pos, idx)) = earliest {
                self.inbox.drain(..pos + tokens[idx].len());
                return Ok(Some(idx));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(READ_SLICE);
            if !self.fill(slice)? {
                return Ok(None);
            }
        }
    }

    /// Read once with a timeout. Returns false at end of stream.
    fn fill(&mut self, timeout: Duration) -> io::Result<bool> {
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; 512];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(read) => {
                self.inbox.push_str(&String::from_utf8_lossy(&buf[..read]));
                Ok(true)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::ConnectionReset => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Everything received and not yet consumed by `wait_for`.
    pub fn unread(&self) -> &str {
        &self.inbox
    }

    pub fn shutdown(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}
