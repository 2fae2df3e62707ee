//! The relay client: dials a relay server, authenticates, and multiplexes
//! many [`Conn`]ections to other peers over the single resulting link.

pub mod conn;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::relay::auth::hmac::AuthToken;
use crate::relay::client::conn::{BufferPool, Conn, ConnContainer, Msg, PeerAddr};
use crate::relay::codec::{self, HashedId, MsgType};
use crate::relay::error::{Error, Result};
use crate::relay::healthcheck;
use crate::relay::metrics::Metrics;
use crate::relay::{BUFFER_SIZE, CURRENT_PROTOCOL_VERSION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Deadline for the `HelloResponse` read during handshake.
const SERVER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);

/// A closure producing a fresh [`AuthToken`] for this client's peer ID,
/// e.g. by calling out to a management server.
pub type TokenFetch = Arc<dyn Fn() -> Result<AuthToken> + Send + Sync>;

/// Whether the read loop should keep going after handling a frame.
enum FrameOutcome {
    Continue,
    Exit,
}

impl FrameOutcome {
    fn is_exit(&self) -> bool {
        matches!(self, FrameOutcome::Exit)
    }
}

struct LinkState {
    write: Arc<tokio::sync::Mutex<WsSink>>,
    read_task: tokio::task::JoinHandle<()>,
}

struct Inner {
    running: bool,
    conns: HashMap<String, ConnContainer>,
    instance_url: Option<String>,
    link: Option<LinkState>,
}

/// Connects to a relay server and manages the resulting link. All public
/// methods are safe to call concurrently. After `close`, the client can be
/// reused by calling `connect` again.
pub struct Client {
    server_url: String,
    hashed_id: HashedId,
    id_string: String,
    token_fetch: TokenFetch,
    buffer_pool: BufferPool,
    connect_lock: tokio::sync::Mutex<()>,
    inner: parking_lot::Mutex<Inner>,
    on_disconnect: parking_lot::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    metrics: Arc<Metrics>,
}

impl Client {
    pub fn new(server_url: impl Into<String>, peer_id: &str, token_fetch: TokenFetch) -> Arc<Self> {
        let hashed_id = HashedId::hash(peer_id);
        Arc::new(Client {
            server_url: server_url.into(),
            id_string: hashed_id.to_string(),
            hashed_id,
            token_fetch,
            buffer_pool: BufferPool::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            inner: parking_lot::Mutex::new(Inner {
                running: false,
                conns: HashMap::new(),
                instance_url: None,
                link: None,
            }),
            on_disconnect: parking_lot::Mutex::new(None),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Establishes a connection to the relay server. Blocks until the
    /// connection is established or an error occurs; a no-op if already
    /// connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        info!(url = %self.server_url, "connecting to relay server");
        let _serialize = self.connect_lock.lock().await;

        if self.inner.lock().running {
            return Ok(());
        }

        let (write, read, instance_url) = self.dial_and_handshake().await?;
        let write = Arc::new(tokio::sync::Mutex::new(write));

        let this = self.clone();
        let read_task = tokio::spawn(async move { this.read_loop(read).await });

        let mut inner = self.inner.lock();
        inner.running = true;
        inner.instance_url = Some(instance_url);
        inner.link = Some(LinkState { write, read_task });
        drop(inner);

        info!(url = %self.server_url, "relay connection established");
        Ok(())
    }

    async fn dial_and_handshake(&self) -> Result<(WsSink, WsSource, String)> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.server_url).await?;
        let (mut sink, mut source) = stream.split();

        let token = (self.token_fetch)()?;
        let hello = codec::marshal_hello(CURRENT_PROTOCOL_VERSION, &self.hashed_id, &token.to_bytes());
        sink.send(Message::Binary(hello.into())).await?;

        let frame = tokio::time::timeout(SERVER_RESPONSE_TIMEOUT, next_binary_frame(&mut source))
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::Timeout)??;

        let (_version, ty) = codec::determine_server_msg_type(&frame)?;
        if ty != MsgType::HelloResponse {
            return Err(Error::UnexpectedMessageType("expected hello response"));
        }
        let instance_url = codec::unmarshal_hello_response(&frame)?;
        Ok((sink, source, instance_url))
    }

    /// Opens a virtual connection to `dst_peer_id`. Fails if the client
    /// isn't connected, or if a connection to that peer is already open.
    pub fn open_conn(self: &Arc<Self>, dst_peer_id: &str) -> Result<Conn> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(Error::NotConnected);
        }

        let remote_id = HashedId::hash(dst_peer_id);
        let key = remote_id.to_string();
        if inner.conns.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }

        info!(peer = %key, "opening connection to peer");
        let (tx, rx) = mpsc::channel(2);
        inner.conns.insert(key.clone(), ConnContainer::new(tx));
        drop(inner);

        Ok(Conn::new(
            self.clone(),
            PeerAddr(self.id_string.clone()),
            PeerAddr(key),
            remote_id,
            rx,
        ))
    }

    /// The relay-advertised URL of the server this client is connected to.
    pub fn server_instance_url(&self) -> Result<String> {
        self.inner
            .lock()
            .instance_url
            .clone()
            .ok_or(Error::NotConnected)
    }

    pub fn has_conns(&self) -> bool {
        !self.inner.lock().conns.is_empty()
    }

    /// This client's own metrics registry (backpressure drops today; not
    /// shared with the server-side registry).
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn set_on_disconnect_listener(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(f));
    }

    /// Closes the connection to the relay server and every open `Conn`.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.teardown(true).await
    }

    async fn teardown(self: &Arc<Self>, graceful: bool) -> Result<()> {
        let _serialize = self.connect_lock.lock().await;

        let link = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return Ok(());
            }
            inner.running = false;
            for (_, container) in inner.conns.drain() {
                container.close();
            }
            inner.link.take()
        };

        let Some(link) = link else { return Ok(()) };

        if graceful {
            let close_frame = codec::marshal_close(CURRENT_PROTOCOL_VERSION);
            let mut guard = link.write.lock().await;
            if let Err(e) = guard.send(Message::Binary(close_frame.into())).await {
                warn!(err = %e, "failed to send close message");
            }
            let _ = guard.close().await;
        }

        // The read loop observes the link closing (or already exited on
        // its own) and returns; wait for it so `close` only returns once
        // teardown is fully complete, mirroring `wgReadLoop.Wait()`.
        let _ = link.read_task.await;

        info!(url = %self.server_url, "relay connection closed");
        Ok(())
    }

    pub(crate) fn close_conn(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(container) = inner.conns.remove(key) {
            container.close();
        }
    }

    pub(crate) async fn write_to(&self, key: &str, dst: &HashedId, payload: &[u8]) -> Result<()> {
        if payload.len() > codec::MAX_TRANSPORT_PAYLOAD {
            return Err(Error::PayloadTooLarge(payload.len(), codec::MAX_TRANSPORT_PAYLOAD));
        }
        let write = {
            let inner = self.inner.lock();
            if !inner.conns.contains_key(key) {
                return Err(Error::Closed);
            }
            match &inner.link {
                Some(link) => link.write.clone(),
                None => return Err(Error::NotConnected),
            }
        };
        let frame = codec::marshal_transport(CURRENT_PROTOCOL_VERSION, dst, payload);
        let mut guard = write.lock().await;
        guard.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    async fn write_raw(&self, buf: Vec<u8>) -> Result<()> {
        let write = match &self.inner.lock().link {
            Some(link) => link.write.clone(),
            None => return Err(Error::NotConnected),
        };
        let mut guard = write.lock().await;
        guard.send(Message::Binary(buf.into())).await?;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut stream: WsSource) {
        let mut hc = healthcheck::Receiver::new();

        loop {
            tokio::select! {
                frame = next_binary_frame(&mut stream) => {
                    match frame {
                        Some(Ok(buf)) => {
                            if buf.len() > BUFFER_SIZE {
                                warn!("oversized frame from relay server, dropping");
                                continue;
                            }
                            if self.handle_frame(&buf, &mut hc).await.is_exit() {
                                debug!("relay server sent close frame, tearing down");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(err = %e, "relay read error, tearing down");
                            break;
                        }
                        None => {
                            debug!("relay closed connection");
                            break;
                        }
                    }
                }
                _ = hc.wait_timeout() => {
                    warn!("relay health check timeout");
                    break;
                }
            }
            if !self.inner.lock().running {
                break;
            }
        }

        self.notify_disconnected();
        let _ = self.teardown(false).await;
    }

    async fn handle_frame(&self, buf: &[u8], hc: &mut healthcheck::Receiver) -> FrameOutcome {
        let (version, ty) = match codec::determine_server_msg_type(buf) {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "failed to determine message type");
                return FrameOutcome::Continue;
            }
        };
        if version != CURRENT_PROTOCOL_VERSION {
            warn!(version, "unexpected protocol version from relay server");
        }

        match ty {
            MsgType::HealthCheck => {
                hc.heartbeat();
                if let Err(e) = self.write_raw(codec::marshal_healthcheck(CURRENT_PROTOCOL_VERSION)).await {
                    warn!(err = %e, "failed to respond to heartbeat");
                }
                FrameOutcome::Continue
            }
            MsgType::Transport => {
                self.dispatch_transport(buf).await;
                FrameOutcome::Continue
            }
            MsgType::Close => {
                info!("relay server closed the connection");
                FrameOutcome::Exit
            }
            other => {
                warn!(?other, "unexpected message type");
                FrameOutcome::Continue
            }
        }
    }

    async fn dispatch_transport(&self, buf: &[u8]) {
        let (src, payload) = match codec::unmarshal_transport_msg(buf) {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "malformed transport frame from relay");
                return;
            }
        };
        let key = src.to_string();

        let mut pooled = self.buffer_pool.acquire();
        pooled[..payload.len()].copy_from_slice(payload);
        let msg = Msg::new(pooled, 0, payload.len());

        let inner = self.inner.lock();
        let Some(container) = inner.conns.get(&key) else {
            drop(inner);
            debug!(peer = %key, "no open connection for source peer, dropping");
            return;
        };
        if !container.deliver(msg) {
            self.metrics.backpressure_drops.inc();
            debug!(peer = %key, "connection channel full or closed, dropping frame");
        }
    }

    fn notify_disconnected(&self) {
        if let Some(f) = self.on_disconnect.lock().as_ref() {
            f();
        }
    }
}

async fn next_binary_frame(stream: &mut WsSource) -> Option<Result<Vec<u8>>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(b))) => return Some(Ok(b.to_vec())),
            Some(Ok(Message::Close(_))) => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Some(Err(e.into())),
            None => return None,
        }
    }
}
