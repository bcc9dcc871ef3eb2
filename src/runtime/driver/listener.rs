use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::EndpointError;
use crate::frame::Framer;
use crate::logging::{LogLevel, Logger, emit_to, json_kv, json_str};
use crate::metrics::SessionMetrics;
use crate::queue::MessageQueue;

use super::socket::SocketEndpoint;

pub const LISTENER_TARGET: &str = "tunelink::listener";
pub const LISTENER_THREAD_NAME: &str = "tunelink-listener";

/// Invoked on the listener thread right after a client is accepted.
pub type AcceptCallback = Box<dyn Fn(SocketAddr) + Send + 'static>;

/// Everything the listener thread needs for one endpoint generation.
pub struct ListenerContext {
    pub endpoint: Arc<SocketEndpoint>,
    pub queue: MessageQueue,
    pub chunk_size: usize,
    pub sleep: Duration,
    pub logger: Option<Logger>,
    pub metrics: Option<Arc<Mutex<SessionMetrics>>>,
}

impl ListenerContext {
    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        emit_to(self.logger.as_ref(), level, LISTENER_TARGET, message, fields);
    }

    fn with_metrics(&self, f: impl FnOnce(&mut SessionMetrics)) {
        if let Some(metrics) = &self.metrics {
            if let Ok(mut guard) = metrics.lock() {
                f(&mut guard);
            }
        }
    }
}

/// Handle to a detached listener thread.
///
/// `stop` only clears the running flag; the thread notices on its next
/// iteration, or sooner when the endpoint is closed under it. The handle is
/// never joined on the poller.
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn spawn(ctx: ListenerContext, on_accepted: AcceptCallback) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(LISTENER_THREAD_NAME.to_string())
            .spawn(move || listen_loop(ctx, flag, on_accepted))?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
        // Detach.
        self.thread.take();
    }
}

fn listen_loop(ctx: ListenerContext, running: Arc<AtomicBool>, on_accepted: AcceptCallback) {
    let mut framer = Framer::new();
    let mut reported_missing = false;

    while running.load(Ordering::Acquire) {
        if !ctx.endpoint.has_listener() {
            if !reported_missing {
                ctx.log(LogLevel::Error, "listening socket does not exist", []);
                reported_missing = true;
            }
        } else if !ctx.endpoint.is_connected() {
            ctx.log(
                LogLevel::Info,
                "waiting for client",
                [json_str("addr", ctx.endpoint.local_addr().to_string())],
            );
            match ctx.endpoint.accept_blocking() {
                Ok(peer) => {
                    framer.reset();
                    ctx.with_metrics(|m| m.record_connection());
                    ctx.log(
                        LogLevel::Info,
                        "client accepted",
                        [json_str("peer", peer.to_string())],
                    );
                    on_accepted(peer);
                }
                Err(EndpointError::Accept { closed: true, .. }) => {
                    ctx.log(LogLevel::Debug, "listening socket closed", []);
                    break;
                }
                Err(err) => {
                    ctx.log(
                        LogLevel::Error,
                        "accept failed",
                        [json_str("error", err.to_string())],
                    );
                    ctx.endpoint.close_listener();
                    break;
                }
            }
        } else {
            match ctx.endpoint.receive_all_available(ctx.chunk_size) {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => {
                    // No byte decodes to the terminator, so every batch is
                    // flushed whole.
                    let messages = framer.decode_batch(&bytes);
                    // A stopped generation must not feed the next one.
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let count = ctx.queue.push_all(messages);
                    ctx.with_metrics(|m| m.record_received(count));
                    ctx.log(
                        LogLevel::Trace,
                        "batch received",
                        [json_kv("bytes", bytes.len()), json_kv("messages", count)],
                    );
                }
                Err(err) if err.is_fatal() => {
                    ctx.log(
                        LogLevel::Warn,
                        "client connection ended",
                        [json_str("reason", err.to_string())],
                    );
                    break;
                }
                // Closed by the poller between the check and the read.
                Err(EndpointError::NotConnected) => {}
                Err(err) => {
                    ctx.log(
                        LogLevel::Error,
                        "receive failed",
                        [json_str("error", err.to_string())],
                    );
                }
            }
        }
        thread::sleep(ctx.sleep);
    }

    ctx.log(LogLevel::Debug, "listener exiting", []);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::logging::MemorySink;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Instant;

    fn context(queue: &MessageQueue, logger: Option<Logger>) -> ListenerContext {
        let endpoint =
            SocketEndpoint::bind_and_listen("127.0.0.1", 0, Duration::from_millis(2)).unwrap();
        ListenerContext {
            endpoint: Arc::new(endpoint),
            queue: queue.clone(),
            chunk_size: 64,
            sleep: Duration::from_millis(2),
            logger,
            metrics: Some(Arc::new(Mutex::new(SessionMetrics::new()))),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn accepted_client_gets_callback_and_messages_queue() {
        let queue = MessageQueue::new();
        let ctx = context(&queue, None);
        let endpoint = Arc::clone(&ctx.endpoint);
        let greeter = Arc::clone(&ctx.endpoint);
        let (tx, rx) = mpsc::channel();
        let mut handle = ListenerHandle::spawn(
            ctx,
            Box::new(move |peer| {
                greeter.send("greeting").ok();
                tx.send(peer).ok();
            }),
        )
        .unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();
        let peer = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        let mut greeting = [0u8; 8];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"greeting");

        client.write_all(&encode_frame("heartbeat", false).unwrap()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        assert_eq!(queue.pop().as_deref(), Some("heartbeat"));

        handle.stop();
        endpoint.close();
        assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));
    }

    #[test]
    fn terminated_frames_in_one_batch_arrive_as_one_message() {
        let queue = MessageQueue::new();
        let ctx = context(&queue, None);
        let endpoint = Arc::clone(&ctx.endpoint);
        let mut handle = ListenerHandle::spawn(ctx, Box::new(|_| {})).unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || endpoint.is_connected()));
        let wire: Vec<u8> = (0..5)
            .flat_map(|_| encode_frame("end_play", true).unwrap())
            .collect();
        client.write_all(&wire).unwrap();

        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        assert_eq!(queue.pop(), Some("end_play\u{100}".repeat(5)));

        client.write_all(&encode_frame("heartbeat", true).unwrap()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || queue.len() == 1));
        assert_eq!(queue.pop().as_deref(), Some("heartbeat\u{100}"));

        handle.stop();
        endpoint.close();
        assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));
    }

    #[test]
    fn peer_close_ends_the_loop() {
        let queue = MessageQueue::new();
        let sink = MemorySink::new();
        let ctx = context(&queue, Some(Logger::new(sink.clone())));
        let endpoint = Arc::clone(&ctx.endpoint);
        let handle = ListenerHandle::spawn(ctx, Box::new(|_| {})).unwrap();

        let client = TcpStream::connect(endpoint.local_addr()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || endpoint.is_connected()));
        drop(client);

        assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));
        assert!(sink.contains("client connection ended"));
        assert!(!handle.is_running());
    }

    #[test]
    fn closing_the_endpoint_unblocks_accept() {
        let queue = MessageQueue::new();
        let ctx = context(&queue, None);
        let endpoint = Arc::clone(&ctx.endpoint);
        let mut handle = ListenerHandle::spawn(ctx, Box::new(|_| {})).unwrap();
        thread::sleep(Duration::from_millis(20));

        handle.stop();
        endpoint.close();
        assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));
        assert!(queue.is_empty());
    }
}
