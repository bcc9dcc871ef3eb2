use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::EndpointError;

pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

/// At most one pending connection is queued by the kernel.
pub const LISTEN_BACKLOG: i32 = 1;

/// Longest a single `send` may block on a client that stopped reading.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn listen_with_backlog(addr: SocketAddr) -> io::Result<TcpListener> {
    use rustix::net::{AddressFamily, SocketFlags, SocketType, sockopt};

    let family = if addr.is_ipv4() {
        AddressFamily::INET
    } else {
        AddressFamily::INET6
    };
    let fd = rustix::net::socket_with(family, SocketType::STREAM, SocketFlags::CLOEXEC, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    rustix::net::bind(&fd, &addr)?;
    rustix::net::listen(&fd, LISTEN_BACKLOG)?;
    Ok(TcpListener::from(fd))
}

#[cfg(not(unix))]
fn listen_with_backlog(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr)
}

fn classify_io(err: &io::Error) -> Option<EndpointError> {
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Some(EndpointError::PeerReset)
        }
        ErrorKind::NotConnected | ErrorKind::UnexpectedEof => Some(EndpointError::PeerClosed),
        _ => None,
    }
}

/// One generation of the controller's TCP endpoint: a listening socket and
/// at most one accepted client.
///
/// Shared between the listener thread (accept/receive) and the poller
/// (send/close) behind an `Arc`. `close` may be called from any thread and
/// unblocks a pending `accept_blocking`; a pending receive is woken by the
/// socket shutdown.
pub struct SocketEndpoint {
    listener: Mutex<Option<TcpListener>>,
    client: Mutex<Option<TcpStream>>,
    peer: Mutex<Option<SocketAddr>>,
    local: SocketAddr,
    accept_poll: Duration,
    send_timeout: Duration,
    accepted: AtomicU64,
    closed: AtomicBool,
}

impl SocketEndpoint {
    pub fn bind_and_listen(address: &str, port: u16, accept_poll: Duration) -> EndpointResult<Self> {
        let target = format!("{address}:{port}");
        let bind_err = |source: io::Error| EndpointError::Bind {
            addr: target.clone(),
            source,
        };

        let addr = (address, port)
            .to_socket_addrs()
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let listener = listen_with_backlog(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            client: Mutex::new(None),
            peer: Mutex::new(None),
            local,
            accept_poll,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            accepted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Applies to clients accepted after the call.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }

    pub fn has_listener(&self) -> bool {
        lock(&self.listener).is_some()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.client).is_some()
    }

    /// Number of clients accepted over the lifetime of this endpoint.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    /// Block until one client connects.
    ///
    /// Fails with `Accept { closed: true }` when the listening socket is
    /// closed during the wait. Refuses to accept while a client is held.
    pub fn accept_blocking(&self) -> EndpointResult<SocketAddr> {
        if self.is_connected() {
            return Err(EndpointError::Accept {
                closed: false,
                reason: "a client is already connected".to_string(),
            });
        }

        loop {
            {
                let guard = lock(&self.listener);
                let Some(listener) = guard.as_ref() else {
                    return Err(EndpointError::Accept {
                        closed: true,
                        reason: "listening socket closed".to_string(),
                    });
                };
                match listener.accept() {
                    Ok((stream, peer)) => {
                        drop(guard);
                        return self.adopt_client(stream, peer);
                    }
                    Err(err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(err) => {
                        return Err(EndpointError::Accept {
                            closed: false,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            thread::sleep(self.accept_poll);
        }
    }

    fn adopt_client(&self, stream: TcpStream, peer: SocketAddr) -> EndpointResult<SocketAddr> {
        stream
            .set_nonblocking(false)
            .map_err(|err| EndpointError::Accept {
                closed: false,
                reason: err.to_string(),
            })?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(|err| EndpointError::Accept {
                closed: false,
                reason: err.to_string(),
            })?;
        stream.set_nodelay(true).ok();

        *lock(&self.client) = Some(stream);
        *lock(&self.peer) = Some(peer);

        // close() may have run between accept and adoption.
        if self.closed.load(Ordering::Acquire) {
            self.close_client();
            return Err(EndpointError::Accept {
                closed: true,
                reason: "endpoint closed during accept".to_string(),
            });
        }

        self.accepted.fetch_add(1, Ordering::AcqRel);
        Ok(peer)
    }

    fn reader(&self) -> EndpointResult<TcpStream> {
        let guard = lock(&self.client);
        let stream = guard.as_ref().ok_or(EndpointError::NotConnected)?;
        stream.try_clone().map_err(EndpointError::Receive)
    }

    /// Read `chunk_size` bytes at a time until a read comes back short.
    ///
    /// A batch may hold several messages. A message whose length is an exact
    /// multiple of `chunk_size` keeps the loop reading, so it merges with
    /// whatever arrives next.
    pub fn receive_all_available(&self, chunk_size: usize) -> EndpointResult<Vec<u8>> {
        let mut stream = self.reader()?;
        let chunk_size = chunk_size.max(1);
        let mut chunk = vec![0u8; chunk_size];
        let mut data = Vec::new();

        loop {
            let read = match stream.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(classify_io(&err).unwrap_or(EndpointError::Receive(err)));
                }
            };
            if read == 0 && data.is_empty() {
                return Err(EndpointError::PeerClosed);
            }
            data.extend_from_slice(&chunk[..read]);
            if read < chunk_size {
                break;
            }
        }
        Ok(data)
    }

    /// Write `message` as plain UTF-8. The controller side does not shift
    /// or terminate outgoing text.
    ///
    /// Blocks at most the send timeout; a client that stopped reading yields
    /// `Send` with a `WouldBlock` or `TimedOut` source.
    pub fn send(&self, message: &str) -> EndpointResult<()> {
        let mut guard = lock(&self.client);
        let stream = guard.as_mut().ok_or(EndpointError::NotConnected)?;
        stream
            .write_all(message.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                    EndpointError::PeerReset
                }
                _ => EndpointError::Send(err),
            })
    }

    /// Drop the client connection. Returns false when there was none.
    pub fn close_client(&self) -> bool {
        let taken = lock(&self.client).take();
        match taken {
            Some(stream) => {
                stream.shutdown(Shutdown::Both).ok();
                true
            }
            None => false,
        }
    }

    /// Drop the listening socket. Returns false when there was none.
    pub fn close_listener(&self) -> bool {
        lock(&self.listener).take().is_some()
    }

    /// Release everything. Safe to call repeatedly and from any thread.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_client();
        self.close_listener();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn endpoint() -> Arc<SocketEndpoint> {
        Arc::new(SocketEndpoint::bind_and_listen("127.0.0.1", 0, Duration::from_millis(2)).unwrap())
    }

    fn accept_in_background(ep: &Arc<SocketEndpoint>) -> thread::JoinHandle<EndpointResult<SocketAddr>> {
        let ep = Arc::clone(ep);
        thread::spawn(move || ep.accept_blocking())
    }

    #[test]
    fn binds_ephemeral_port() {
        let ep = endpoint();
        assert_ne!(ep.local_addr().port(), 0);
        assert!(ep.has_listener());
        assert!(!ep.is_connected());
    }

    #[test]
    fn port_in_use_is_a_bind_error() {
        let first = endpoint();
        let err = SocketEndpoint::bind_and_listen(
            "127.0.0.1",
            first.local_addr().port(),
            Duration::from_millis(2),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EndpointError::Bind { .. }));
    }

    #[test]
    fn unresolvable_address_is_a_bind_error() {
        let err = SocketEndpoint::bind_and_listen("not an address", 1, Duration::from_millis(2))
            .err()
            .unwrap();
        assert!(matches!(err, EndpointError::Bind { .. }));
    }

    #[test]
    fn accept_records_peer() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let client = TcpStream::connect(ep.local_addr()).unwrap();
        let peer = pending.join().unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(ep.peer_addr(), Some(peer));
        assert_eq!(ep.accepted_count(), 1);
        assert!(ep.is_connected());
    }

    #[test]
    fn close_unblocks_accept_as_closed() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        thread::sleep(Duration::from_millis(30));
        ep.close();
        let err = pending.join().unwrap().unwrap_err();
        assert!(matches!(err, EndpointError::Accept { closed: true, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn second_accept_refused_while_client_held() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let _first = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();

        let _second = TcpStream::connect(ep.local_addr());
        let err = ep.accept_blocking().unwrap_err();
        assert!(matches!(err, EndpointError::Accept { closed: false, .. }));
        assert_eq!(ep.accepted_count(), 1);
    }

    #[test]
    fn short_read_ends_a_batch() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let mut client = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();

        client.write_all(b"abc").unwrap();
        let data = ep.receive_all_available(8).unwrap();
        assert_eq!(data, b"abc");
    }

    // A message exactly one chunk long keeps the reader waiting, so the next
    // message lands in the same batch.
    #[test]
    fn exact_chunk_multiple_merges_with_next_message() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let mut client = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();

        client.write_all(b"abcd").unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            client.write_all(b"ef").unwrap();
            client
        });
        let data = ep.receive_all_available(4).unwrap();
        let _client = writer.join().unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[test]
    fn peer_close_is_reported() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let client = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();
        drop(client);
        let err = ep.receive_all_available(16).unwrap_err();
        assert!(matches!(err, EndpointError::PeerClosed));
    }

    #[test]
    fn send_to_vanished_peer_becomes_peer_reset() {
        let ep = endpoint();
        let pending = accept_in_background(&ep);
        let client = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut last = Ok(());
        while Instant::now() < deadline {
            last = ep.send("heartbeat");
            if last.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(last, Err(EndpointError::PeerReset)));
    }

    #[test]
    fn stalled_reader_times_out_the_send() {
        let ep = Arc::new(
            SocketEndpoint::bind_and_listen("127.0.0.1", 0, Duration::from_millis(2))
                .unwrap()
                .with_send_timeout(Duration::from_millis(50)),
        );
        let pending = accept_in_background(&ep);
        let _client = TcpStream::connect(ep.local_addr()).unwrap();
        pending.join().unwrap().unwrap();

        let block = "x".repeat(256 * 1024);
        let mut outcome = Ok(());
        for _ in 0..400 {
            let started = Instant::now();
            outcome = ep.send(&block);
            assert!(started.elapsed() < Duration::from_secs(2));
            if outcome.is_err() {
                break;
            }
        }
        match outcome {
            Err(EndpointError::Send(err)) => assert!(matches!(
                err.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut
            )),
            other => panic!("expected a send timeout, got {other:?}"),
        }

        // The poller can still tear the connection down.
        assert!(ep.close_client());
    }

    #[test]
    fn send_without_client_is_not_connected() {
        let ep = endpoint();
        assert!(matches!(ep.send("x"), Err(EndpointError::NotConnected)));
    }

    #[test]
    fn close_is_idempotent() {
        let ep = endpoint();
        ep.close();
        ep.close();
        assert!(!ep.has_listener());
        assert!(!ep.close_client());
        assert!(!ep.close_listener());
        assert!(ep.is_closed());
    }
}
