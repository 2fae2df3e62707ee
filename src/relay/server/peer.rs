//! The server-side `Peer`: owns one inbound WebSocket connection, runs the
//! read loop, dispatches frames by type, and forwards Transport frames to
//! their destination via the [`Store`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::relay::auth::hmac::{AuthToken, Validator};
use crate::relay::codec::{self, HashedId, MsgType};
use crate::relay::healthcheck;
use crate::relay::metrics::Metrics;
use crate::relay::server::store::Store;
use crate::relay::{CURRENT_PROTOCOL_VERSION, BUFFER_SIZE};

/// Deadline for the graceful-close write.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

type BoxedSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// Represents one connected client. The write half is boxed behind a
/// plain `Sink<Message>` rather than naming `SplitSink<WebSocket, _>`
/// directly, so tests can register peers backed by an in-memory sink
/// instead of a real socket (see `server::store`'s tests).
pub struct Peer {
    id: HashedId,
    id_string: String,
    write: tokio::sync::Mutex<BoxedSink>,
}

impl Peer {
    fn new(id: HashedId, write: impl Sink<Message, Error = axum::Error> + Send + 'static) -> Self {
        Peer {
            id_string: id.to_string(),
            id,
            write: tokio::sync::Mutex::new(Box::pin(write)),
        }
    }

    /// Builds a peer with a sink that discards every frame, for tests
    /// that only exercise registry bookkeeping and never expect to
    /// observe what was written.
    #[cfg(test)]
    pub(crate) fn new_for_test(id: HashedId) -> Arc<Peer> {
        Arc::new(Peer::new(id, futures_util::sink::drain().sink_map_err(|e: std::convert::Infallible| match e {})))
    }

    pub fn id(&self) -> &HashedId {
        &self.id
    }

    pub fn id_string(&self) -> &str {
        &self.id_string
    }

    /// Writes a raw frame to this peer's connection.
    pub async fn write(&self, buf: Vec<u8>) -> crate::relay::error::Result<()> {
        let mut guard = self.write.lock().await;
        guard.send(Message::Binary(buf)).await?;
        Ok(())
    }

    /// Sends a Close frame within [`GRACEFUL_CLOSE_TIMEOUT`], then closes
    /// the socket regardless of whether the write succeeded — both steps
    /// are unconditional so a slow client can never wedge this task.
    pub async fn close_gracefully(&self) {
        let close_frame = codec::marshal_close(CURRENT_PROTOCOL_VERSION);
        let write_result = tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, async {
            let mut guard = self.write.lock().await;
            guard.send(Message::Binary(close_frame)).await
        })
        .await;
        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(peer_id = %self.id_string, err = %e, "failed to send close frame"),
            Err(_) => warn!(peer_id = %self.id_string, "timed out sending close frame"),
        }
        let mut guard = self.write.lock().await;
        let _ = guard.close().await;
    }
}

/// Runs one peer's entire lifecycle: handshake, register in `store`, read
/// loop, teardown. Consumes the already-upgraded WebSocket; the caller
/// performs any TLS termination and HTTP upgrade before calling this.
pub async fn run(
    socket: WebSocket,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    validator: Arc<Validator>,
    exposed_address: Arc<str>,
) {
    let (mut sink, mut stream) = socket.split();

    let (id, id_string) = match handshake(&mut sink, &mut stream, &validator, &exposed_address).await {
        Ok(id) => id,
        Err(e) => {
            metrics.handshake_failures.with_label_values(&[e.kind()]).inc();
            if matches!(e, crate::relay::error::Error::AuthInvalid | crate::relay::error::Error::AuthExpired) {
                metrics.auth_failures.inc();
            }
            warn!(err = %e, "handshake failed, closing connection");
            let _ = sink.close().await;
            return;
        }
    };

    let peer = Arc::new(Peer::new(id, sink));
    if let Some(displaced) = store.add_or_replace(peer.clone()) {
        info!(peer_id = %id_string, "replacing existing session for this peer id");
        displaced.close_gracefully().await;
    }
    metrics.active_peers.inc();

    work(&peer, stream, &store, &metrics).await;

    if store.remove(&peer.id, &peer) {
        metrics.active_peers.dec();
    }
}

/// Handshake deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

async fn handshake(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    validator: &Validator,
    exposed_address: &str,
) -> crate::relay::error::Result<(HashedId, String)> {
    use crate::relay::error::Error;

    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_binary_frame(stream))
        .await
        .map_err(|_| Error::Timeout)?
        .ok_or(Error::Timeout)??;

    let (version, ty) = codec::determine_client_msg_type(&frame)?;
    if version != CURRENT_PROTOCOL_VERSION {
        return Err(Error::ProtocolVersionMismatch(version));
    }
    if ty != MsgType::Hello {
        return Err(Error::UnexpectedMessageType("expected hello"));
    }
    let (id, token_bytes) = codec::unmarshal_hello(&frame)?;
    let token = AuthToken::from_bytes(token_bytes)?;
    if token.id.0 != id.0 {
        return Err(Error::AuthInvalid);
    }
    validator.validate(&token)?;

    sink.send(Message::Binary(codec::marshal_hello_response(
        CURRENT_PROTOCOL_VERSION,
        exposed_address,
    )))
    .await?;
    Ok((id, id.to_string()))
}

async fn next_binary_frame(stream: &mut SplitStream<WebSocket>) -> Option<crate::relay::error::Result<Vec<u8>>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(b))) => return Some(Ok(b)),
            Some(Ok(Message::Close(_))) => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Some(Err(e.into())),
            None => return None,
        }
    }
}

async fn work(peer: &Arc<Peer>, mut stream: SplitStream<WebSocket>, store: &Arc<Store>, metrics: &Arc<Metrics>) {
    let mut hc = healthcheck::Sender::new();

    loop {
        tokio::select! {
            frame = next_binary_frame(&mut stream) => {
                match frame {
                    Some(Ok(buf)) => {
                        if buf.len() > BUFFER_SIZE {
                            warn!(peer_id = %peer.id_string, "oversized frame, dropping");
                            continue;
                        }
                        if handle_frame(peer, &buf, store, metrics, &mut hc).await.is_exit() {
                            debug!(peer_id = %peer.id_string, "peer sent close frame, tearing down");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(peer_id = %peer.id_string, err = %e, "read error, tearing down");
                        return;
                    }
                    None => {
                        debug!(peer_id = %peer.id_string, "peer exited gracefully");
                        return;
                    }
                }
            }
            should_ping = hc.poll() => {
                if !should_ping {
                    warn!(peer_id = %peer.id_string, "peer healthcheck timeout");
                    return;
                }
                if peer.write(codec::marshal_healthcheck(CURRENT_PROTOCOL_VERSION)).await.is_err() {
                    return;
                }
            }
        }
    }
}

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

async fn handle_frame(
    peer: &Arc<Peer>,
    buf: &[u8],
    store: &Store,
    metrics: &Arc<Metrics>,
    hc: &mut healthcheck::Sender,
) -> FrameOutcome {
    let (version, ty) = match codec::determine_client_msg_type(buf) {
        Ok(v) => v,
        Err(e) => {
            warn!(peer_id = %peer.id_string, err = %e, "failed to determine message type");
            return FrameOutcome::Continue;
        }
    };
    if version != CURRENT_PROTOCOL_VERSION {
        // Forward-compatible leniency: accept the message but log.
        // Only the handshake itself is strict about version matching.
        warn!(peer_id = %peer.id_string, version, "unexpected protocol version on existing session");
    }

    metrics.record_peer_activity(&peer.id_string);

    match ty {
        MsgType::HealthCheck => {
            hc.on_response();
            FrameOutcome::Continue
        }
        MsgType::Transport => {
            metrics.bytes_received.inc_by(buf.len() as u64);
            handle_transport(peer, buf, store, metrics).await;
            FrameOutcome::Continue
        }
        MsgType::Close => {
            info!(peer_id = %peer.id_string, "peer sent close frame");
            FrameOutcome::Exit
        }
        other => {
            warn!(peer_id = %peer.id_string, ?other, "unexpected message type");
            FrameOutcome::Continue
        }
    }
}

async fn handle_transport(peer: &Arc<Peer>, buf: &[u8], store: &Store, metrics: &Arc<Metrics>) {
    let (_version, dst) = match codec::unmarshal_transport_id(buf) {
        Ok(v) => v,
        Err(e) => {
            warn!(peer_id = %peer.id_string, err = %e, "malformed transport frame");
            return;
        }
    };

    let target = match store.get(&dst) {
        Some(p) => p,
        None => {
            debug!(peer_id = %peer.id_string, dst = %dst, "destination peer not found, dropping");
            return;
        }
    };

    let mut owned = buf.to_vec();
    if let Err(e) = codec::update_transport_msg(&mut owned, &peer.id) {
        error!(peer_id = %peer.id_string, err = %e, "failed to rewrite transport destination");
        return;
    }

    let len = owned.len() as u64;
    if target.write(owned).await.is_ok() {
        metrics.bytes_sent.inc_by(len);
    }
}
