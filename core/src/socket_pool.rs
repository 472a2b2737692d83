//! Socket Pool (spec.md §4.B): per-peer reliable connections, idle reuse, and the
//! implicit read loop that dispatches unsolicited inbound requests.
//!
//! The pool's internal lock (`Mutex` around the slot table) is only ever held for
//! map mutations, never across I/O (spec.md §5). Ownership of a borrowed stream is
//! exclusive: a worker disables the idle read loop for the duration of one transfer
//! and must `release` it back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::protocol::Message;
use crate::wire::{self, FrameDecodeError, FrameEncodeError, Header};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Any duplex byte stream the pool can hold — satisfied by `tokio::net::TcpStream` or
/// any other reliable-stream transport a host wires in.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// A stream borrowed from the pool for the duration of one transfer.
pub struct PooledStream {
    pub peer: PeerId,
    pub direction: Direction,
    stream: Box<dyn Duplex>,
}

/// Outcome of waiting for the next frame on an idle stream.
pub enum FrameWait {
    Frame(Header, Message),
    TimedOut,
    Closed,
    Error(FrameDecodeError),
}

impl PooledStream {
    pub fn new(peer: PeerId, direction: Direction, stream: Box<dyn Duplex>) -> Self {
        Self {
            peer,
            direction,
            stream,
        }
    }

    pub async fn send_frame(
        &mut self,
        msg: &Message,
        tag: u32,
        sender: PeerId,
    ) -> Result<(), FrameEncodeError> {
        let frame = wire::encode_stream_frame(msg, tag, sender)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|_| FrameEncodeError::BodyTooLarge)?;
        Ok(())
    }

    /// Read exactly one frame, blocking the caller (no timeout). Used by a worker that
    /// owns the stream outright, e.g. waiting for a `GetChunkResult`.
    pub async fn read_frame(&mut self) -> Result<(Header, Message), FrameDecodeError> {
        let mut buf = [0u8; wire::HEADER_LEN];
        self.read_exact_raw_into(&mut buf)
            .await
            .map_err(|_| FrameDecodeError::Truncated)?;
        let body_len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if body_len > wire::MAX_STREAM_BODY {
            return Err(FrameDecodeError::BodyTooLarge);
        }
        let mut full = Vec::with_capacity(wire::HEADER_LEN + body_len);
        full.extend_from_slice(&buf);
        full.resize(wire::HEADER_LEN + body_len, 0);
        self.read_exact_raw_into(&mut full[wire::HEADER_LEN..])
            .await
            .map_err(|_| FrameDecodeError::Truncated)?;
        let (header, msg, _) = wire::decode_stream_frame(&full)?;
        Ok((header, msg))
    }

    /// Wait up to `timeout` for the next frame; used by the idle read loop.
    pub async fn wait_for_frame(&mut self, timeout: Duration) -> FrameWait {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Err(_) => FrameWait::TimedOut,
            Ok(Err(FrameDecodeError::Truncated)) => FrameWait::Closed,
            Ok(Err(e)) => FrameWait::Error(e),
            Ok(Ok((header, msg))) => FrameWait::Frame(header, msg),
        }
    }

    /// Raw byte transfer after a `GetChunkResult{Ok}` switches the stream out of framing.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }

    pub async fn write_raw(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn read_exact_raw_into(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf).await.map(|_| ())
    }
}

/// Invoked when an idle stream receives an unsolicited inbound request.
#[async_trait]
pub trait InboundDispatcher: Send + Sync {
    async fn dispatch(&self, stream: PooledStream, header: Header, message: Message);
}

struct Slot {
    cancel_tx: oneshot::Sender<oneshot::Sender<PooledStream>>,
    last_use: Instant,
    task: JoinHandle<()>,
}

/// Per-peer reliable connections with idle reuse (spec.md §3 "Socket entry").
pub struct SocketPool {
    idle_timeout: Duration,
    slots: Mutex<HashMap<(PeerId, Direction), Vec<Slot>>>,
    dispatcher: Arc<dyn InboundDispatcher>,
}

impl SocketPool {
    pub fn new(dispatcher: Arc<dyn InboundDispatcher>) -> Arc<Self> {
        Self::with_idle_timeout(dispatcher, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(dispatcher: Arc<dyn InboundDispatcher>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            idle_timeout,
            slots: Mutex::new(HashMap::new()),
            dispatcher,
        })
    }

    /// Acquire a stream for `peer`/`direction`, reusing an idle one if present, else
    /// dialing a fresh connection via `dial`.
    pub async fn acquire<F, Fut>(
        &self,
        peer: PeerId,
        direction: Direction,
        dial: F,
    ) -> std::io::Result<PooledStream>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<Box<dyn Duplex>>>,
    {
        let reclaimed = {
            let mut slots = self.slots.lock().await;
            slots
                .get_mut(&(peer, direction))
                .and_then(|v| if v.is_empty() { None } else { Some(v.remove(0)) })
        };
        if let Some(slot) = reclaimed {
            let (tx, rx) = oneshot::channel();
            if slot.cancel_tx.send(tx).is_ok() {
                if let Ok(stream) = rx.await {
                    debug!(peer = %peer, "socket pool: reused idle stream");
                    return Ok(stream);
                }
            }
            // Idle task already exited (closed or dispatched); fall through to dial.
            let _ = slot.task.await;
        }
        let raw = dial().await?;
        debug!(peer = %peer, "socket pool: dialed new stream");
        Ok(PooledStream::new(peer, direction, raw))
    }

    /// Hand a freshly-accepted inbound connection its first frame and dispatch it. The
    /// pool doesn't know which peer dialed in until that first frame's header names the
    /// sender, so this bypasses `acquire`/the slot table entirely; the dispatcher's own
    /// `release` call (keyed off `header.sender`) is what first registers the stream for
    /// idle reuse (spec.md §4.B "An idle stream that receives an unsolicited inbound
    /// message is handed synchronously to the message dispatcher").
    pub async fn accept(&self, raw: Box<dyn Duplex>) {
        let mut placeholder = PooledStream::new(PeerId::from_bytes([0u8; crate::identity::PEER_ID_LEN]), Direction::Inbound, raw);
        match placeholder.read_frame().await {
            Ok((header, msg)) => {
                let stream = PooledStream::new(header.sender, Direction::Inbound, placeholder.stream);
                self.dispatcher.dispatch(stream, header, msg).await;
            }
            Err(e) => {
                debug!(error = %e, "socket pool: dropped inbound connection before a valid frame arrived");
            }
        }
    }

    /// Return a borrowed stream. `keep_alive = false` closes it; otherwise it becomes
    /// idle and is re-armed for inbound dispatch.
    pub async fn release(&self, stream: PooledStream, keep_alive: bool) {
        let key = (stream.peer, stream.direction);
        if !keep_alive {
            debug!(peer = %stream.peer, "socket pool: closing stream");
            return; // dropping `stream` closes it
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let dispatcher = self.dispatcher.clone();
        let idle_timeout = self.idle_timeout;
        let task = tokio::spawn(idle_loop(stream, cancel_rx, dispatcher, idle_timeout));
        let mut slots = self.slots.lock().await;
        slots.entry(key).or_default().push(Slot {
            cancel_tx,
            last_use: Instant::now(),
            task,
        });
    }

    /// Defensive sweep: idle connections close themselves on their own timeout, but a
    /// long-lived reaper task catches slots whose read task died without cleaning up
    /// (e.g. a panic), matching the "socket pool reaper" role named in spec.md §5.
    pub async fn reap_stale_slots(&self) {
        let mut slots = self.slots.lock().await;
        for (_key, vec) in slots.iter_mut() {
            vec.retain(|slot| {
                let alive = !slot.task.is_finished();
                if !alive {
                    warn!("socket pool: reaping a slot whose idle task already exited");
                }
                alive
            });
        }
        slots.retain(|_, v| !v.is_empty());
    }

    pub async fn idle_count(&self, peer: PeerId, direction: Direction) -> usize {
        self.slots
            .lock()
            .await
            .get(&(peer, direction))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub async fn oldest_idle_age(&self, peer: PeerId, direction: Direction) -> Option<Duration> {
        self.slots
            .lock()
            .await
            .get(&(peer, direction))
            .and_then(|v| v.iter().map(|s| s.last_use.elapsed()).max())
    }
}

async fn idle_loop(
    mut stream: PooledStream,
    mut cancel_rx: oneshot::Receiver<oneshot::Sender<PooledStream>>,
    dispatcher: Arc<dyn InboundDispatcher>,
    idle_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            give_back = &mut cancel_rx => {
                if let Ok(reply) = give_back {
                    let _ = reply.send(stream);
                }
                return;
            }
            wait = stream.wait_for_frame(idle_timeout) => {
                match wait {
                    FrameWait::Frame(header, msg) => {
                        dispatcher.dispatch(stream, header, msg).await;
                        return;
                    }
                    FrameWait::TimedOut => {
                        debug!(peer = %stream.peer, "socket pool: idle stream expired");
                        return;
                    }
                    FrameWait::Closed | FrameWait::Error(_) => {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct NullDispatcher;
    #[async_trait]
    impl InboundDispatcher for NullDispatcher {
        async fn dispatch(&self, _stream: PooledStream, _header: Header, _message: Message) {}
    }

    #[tokio::test]
    async fn release_then_reacquire_reuses_stream() {
        let pool = SocketPool::with_idle_timeout(Arc::new(NullDispatcher), Duration::from_secs(5));
        let peer = PeerId::generate();
        let (a, _b) = duplex(4096);
        let stream = PooledStream::new(peer, Direction::Outbound, Box::new(a));
        pool.release(stream, true).await;
        assert_eq!(pool.idle_count(peer, Direction::Outbound).await, 1);

        let reacquired = pool
            .acquire(peer, Direction::Outbound, || async {
                panic!("should not dial, an idle stream exists")
            })
            .await
            .unwrap();
        assert_eq!(reacquired.peer, peer);
        assert_eq!(pool.idle_count(peer, Direction::Outbound).await, 0);
    }

    #[tokio::test]
    async fn acquire_dials_when_no_idle_stream() {
        let pool = SocketPool::new(Arc::new(NullDispatcher));
        let peer = PeerId::generate();
        let (a, _b) = duplex(4096);
        let mut dialed = false;
        let stream = pool
            .acquire(peer, Direction::Outbound, || async {
                dialed = true;
                Ok(Box::new(a) as Box<dyn Duplex>)
            })
            .await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn idle_stream_expires_after_timeout() {
        let pool = SocketPool::with_idle_timeout(Arc::new(NullDispatcher), Duration::from_millis(20));
        let peer = PeerId::generate();
        let (a, _b) = duplex(4096);
        let stream = PooledStream::new(peer, Direction::Outbound, Box::new(a));
        pool.release(stream, true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.reap_stale_slots().await;
        assert_eq!(pool.idle_count(peer, Direction::Outbound).await, 0);
    }

    struct RecordingDispatcher(tokio::sync::Mutex<Option<(PeerId, Header)>>);
    #[async_trait]
    impl InboundDispatcher for RecordingDispatcher {
        async fn dispatch(&self, stream: PooledStream, header: Header, _message: Message) {
            *self.0.lock().await = Some((stream.peer, header));
        }
    }

    #[tokio::test]
    async fn accept_learns_peer_from_first_frame() {
        let dispatcher = Arc::new(RecordingDispatcher(tokio::sync::Mutex::new(None)));
        let pool = SocketPool::new(dispatcher.clone());
        let (mut client, server) = duplex(4096);
        let sender = PeerId::generate();
        let frame = wire::encode_stream_frame(&Message::Ping { sender }, 5, sender).unwrap();
        client.write_all(&frame).await.unwrap();
        pool.accept(Box::new(server)).await;
        let recorded = dispatcher.0.lock().await.take().unwrap();
        assert_eq!(recorded.0, sender);
        assert_eq!(recorded.1.sender, sender);
    }
}
