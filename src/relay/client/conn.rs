//! The client-side virtual connection: a `Conn` looks like a connected byte
//! stream to the caller, but is really one entry in a [`Client`]'s demuxed
//! transport table, identified by the destination's hashed peer ID.
//!
//! Buffers are checked out of a [`BufferPool`] and returned automatically on
//! drop via [`PooledBuf`], so "free exactly once" doesn't depend on every
//! call site remembering to release it.

use std::fmt;
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::relay::client::Client;
use crate::relay::codec::HashedId;
use crate::relay::error::Error;
use crate::relay::BUFFER_SIZE;

/// A fixed-size byte buffer checked out of a [`BufferPool`]. Returned to
/// the pool on `Drop` instead of via an explicit `Free()` call.
pub struct PooledBuf {
    pool: Arc<BufferPoolInner>,
    buf: Vec<u8>,
}

impl Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.buf.clear();
        self.buf.resize(BUFFER_SIZE, 0);
        self.pool.free.lock().push(std::mem::take(&mut self.buf));
    }
}

struct BufferPoolInner {
    free: parking_lot::Mutex<Vec<Vec<u8>>>,
}

/// Per-client pool of `BUFFER_SIZE` byte buffers, checked out once per
/// inbound frame and recycled once the consumer has read the frame (or it
/// was dropped for backpressure).
#[derive(Clone)]
pub struct BufferPool(Arc<BufferPoolInner>);

impl BufferPool {
    pub fn new() -> Self {
        BufferPool(Arc::new(BufferPoolInner {
            free: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .0
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        PooledBuf {
            pool: self.0.clone(),
            buf,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One message handed from the link's read loop to a [`Conn`]: the pooled
/// buffer that carried it, plus the `[start, end)` range within it that
/// holds the payload (the rest is the frame header the buffer was
/// originally read into).
pub struct Msg {
    buf: PooledBuf,
    start: usize,
    end: usize,
}

impl Msg {
    pub fn new(buf: PooledBuf, start: usize, end: usize) -> Self {
        Msg { buf, start, end }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }
}

/// Guards delivery into a [`Conn`]'s channel: once `close`d, further
/// `deliver` calls are no-ops rather than panicking on a closed channel.
pub(crate) struct ConnContainer {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Msg>>>,
}

impl ConnContainer {
    pub fn new(tx: mpsc::Sender<Msg>) -> Self {
        ConnContainer {
            tx: parking_lot::Mutex::new(Some(tx)),
        }
    }

    /// Attempts non-blocking delivery. Returns `false` if the container is
    /// closed or the channel is full (caller's cue to count a backpressure
    /// drop), `true` on successful hand-off.
    pub fn deliver(&self, msg: Msg) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// A synthetic, `Display`-able stand-in for a socket address, since a
/// hashed peer ID has no real `std::net::SocketAddr` representation.
#[derive(Clone, Eq, PartialEq)]
pub struct PeerAddr(pub String);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay:{}", self.0)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({})", self.0)
    }
}

type WriteFut = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

/// A byte-stream handle to one remote peer, multiplexed over the client's
/// single relay link. Reads observe `Transport` frames addressed to this
/// peer; writes are framed as `Transport` frames addressed to `remote`.
pub struct Conn {
    client: Arc<Client>,
    local: PeerAddr,
    remote: PeerAddr,
    remote_id: HashedId,
    rx: mpsc::Receiver<Msg>,
    pending: Option<(Msg, usize)>,
    write_fut: Option<WriteFut>,
}

impl Conn {
    pub(crate) fn new(
        client: Arc<Client>,
        local: PeerAddr,
        remote: PeerAddr,
        remote_id: HashedId,
        rx: mpsc::Receiver<Msg>,
    ) -> Self {
        Conn {
            client,
            local,
            remote,
            remote_id,
            rx,
            pending: None,
            write_fut: None,
        }
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &PeerAddr {
        &self.remote
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.client.close_conn(&self.remote.0);
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some((msg, offset)) = self.pending.take() {
                let remaining = &msg.payload()[offset..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                if offset + n < msg.payload().len() {
                    self.pending = Some((msg, offset + n));
                }
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(msg) => self.pending = Some((msg, 0)),
                // Channel closed: the link went down or this Conn was
                // removed from the client's table. Treated as EOF.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.write_fut.as_mut() {
                let result = ready!(fut.as_mut().poll(cx));
                this.write_fut = None;
                return Poll::Ready(result);
            }
            if buf.len() > crate::relay::codec::MAX_TRANSPORT_PAYLOAD {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    Error::PayloadTooLarge(buf.len(), crate::relay::codec::MAX_TRANSPORT_PAYLOAD),
                )));
            }
            let client = this.client.clone();
            let key = this.remote.0.clone();
            let dst = this.remote_id;
            let payload = buf.to_vec();
            let len = payload.len();
            this.write_fut = Some(Box::pin(async move {
                client
                    .write_to(&key, &dst, &payload)
                    .await
                    .map(|_| len)
                    .map_err(|e| match e {
                        Error::Closed | Error::NotConnected => {
                            io::Error::new(io::ErrorKind::NotConnected, e)
                        }
                        other => io::Error::other(other),
                    })
            }));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.client.close_conn(&self.remote.0);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_buf_returns_to_pool_on_drop() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire();
            buf[0] = 0xAB;
        }
        let reused = pool.acquire();
        assert_eq!(reused.len(), BUFFER_SIZE);
        assert_eq!(reused[0], 0); // cleared on return
        assert_eq!(pool.0.free.lock().len(), 0);
    }

    #[test]
    fn container_drops_messages_once_closed() {
        let (tx, mut rx) = mpsc::channel(2);
        let container = ConnContainer::new(tx);
        let pool = BufferPool::new();
        let msg = Msg::new(pool.acquire(), 0, 4);
        assert!(container.deliver(msg));
        container.close();
        let msg2 = Msg::new(pool.acquire(), 0, 4);
        assert!(!container.deliver(msg2));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn container_reports_full_channel_as_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let container = ConnContainer::new(tx);
        let pool = BufferPool::new();
        assert!(container.deliver(Msg::new(pool.acquire(), 0, 1)));
        assert!(!container.deliver(Msg::new(pool.acquire(), 0, 1)));
    }
}
