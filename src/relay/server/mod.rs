//! The relay server: accepts WebSocket connections, runs the handshake and
//! forwarding logic in [`peer`], and exposes a Prometheus `/metrics`
//! endpoint.
//!
//! A single top-level struct is built by `new()`; `run()` owns the accept
//! loop and binds the listener(s) to completion.

pub mod peer;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::relay::auth::hmac::Validator;
use crate::relay::config::ServerConfig;
use crate::relay::error::{Error, Result};
use crate::relay::metrics::Metrics;
use crate::relay::server::store::Store;

/// Deadline the server waits for in-flight peer tasks to drain during
/// graceful shutdown before abandoning them.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    validator: Arc<Validator>,
    exposed_address: Arc<str>,
}

/// Owns every resource needed to run the relay: the peer registry, the
/// auth validator, the metrics registry, and the listeners. Constructed
/// once via [`Server::new`] and driven to completion with [`Server::run`].
pub struct Server {
    config: ServerConfig,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    validator: Arc<Validator>,
    shutdown_tx: broadcast::Sender<()>,
    bound_addr_tx: watch::Sender<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let validator = Arc::new(Validator::new(config.auth_secret.as_bytes()));
        let (shutdown_tx, _) = broadcast::channel(1);
        let (bound_addr_tx, _) = watch::channel(None);
        Server {
            config,
            store: Arc::new(Store::new()),
            metrics: Arc::new(Metrics::new()),
            validator,
            shutdown_tx,
            bound_addr_tx,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Resolves to the relay listener's actual bound address once `run`
    /// has started it. Mainly useful in tests that bind to `:0` and need
    /// to learn the ephemeral port the OS assigned.
    pub async fn local_addr(&self) -> SocketAddr {
        let mut rx = self.bound_addr_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow() {
                return addr;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`, so this only fires
                // if `self` is being dropped concurrently.
                panic!("server dropped before binding");
            }
        }
    }

    /// Signals every running peer task and the accept loops to shut down.
    /// Safe to call from another task once [`Server::run`] is in flight.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn router(&self) -> Router {
        let state = AppState {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            validator: self.validator.clone(),
            exposed_address: Arc::from(self.config.exposed_address.as_str()),
        };
        Router::new()
            .route("/relay", get(relay_upgrade))
            .with_state(state)
    }

    fn metrics_router(&self) -> Router {
        let metrics = self.metrics.clone();
        Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(metrics)
    }

    /// Runs the relay listener (and, if configured, a separate metrics
    /// listener) to completion, returning once `request_shutdown` has been
    /// called and every peer task has drained (or the drain deadline
    /// elapsed).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(addr = %self.config.listen_address, plaintext = self.config.is_plaintext(), "starting relay listener");
        let router = self.router();
        let std_listener = std::net::TcpListener::bind(self.config.listen_address).map_err(Error::Io)?;
        std_listener.set_nonblocking(true).map_err(Error::Io)?;
        let bound_addr = std_listener.local_addr().map_err(Error::Io)?;
        let _ = self.bound_addr_tx.send(Some(bound_addr));

        let relay_task = if self.config.is_plaintext() {
            let listener = tokio::net::TcpListener::from_std(std_listener).map_err(Error::Io)?;
            tokio::spawn(serve_plaintext(listener, router, self.shutdown_tx.subscribe()))
        } else {
            let tls_config = self.load_tls_config().await?;
            tokio::spawn(serve_tls(
                std_listener,
                router,
                tls_config,
                self.shutdown_tx.subscribe(),
            ))
        };

        let metrics_task = if let Some(addr) = self.config.metrics_listen_address {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;
            info!(addr = %addr, "metrics listener bound");
            let router = self.metrics_router();
            Some(tokio::spawn(serve_plaintext(listener, router, self.shutdown_tx.subscribe())))
        } else {
            None
        };

        let _ = shutdown_rx.recv().await;
        info!("shutdown requested, draining peer connections");

        let peers = self.store.all();
        let drain = async {
            for peer in &peers {
                peer.close_gracefully().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("graceful drain deadline elapsed, some peers may not have been notified");
        }

        let _ = relay_task.await;
        if let Some(task) = metrics_task {
            let _ = task.await;
        }

        Ok(())
    }

    async fn load_tls_config(&self) -> Result<RustlsConfig> {
        let cert = self
            .config
            .tls_cert_file
            .as_deref()
            .ok_or_else(|| Error::Config("tls_cert_file required when tls_key_file is set".into()))?;
        let key = self
            .config
            .tls_key_file
            .as_deref()
            .ok_or_else(|| Error::Config("tls_key_file required when tls_cert_file is set".into()))?;
        RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| Error::Config(format!("failed to load TLS credentials: {e}")))
    }
}

async fn serve_plaintext(listener: tokio::net::TcpListener, router: Router, mut shutdown_rx: broadcast::Receiver<()>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;
    if let Err(e) = result {
        warn!(err = %e, "listener exited with error");
    }
}

async fn serve_tls(
    listener: std::net::TcpListener,
    router: Router,
    tls_config: RustlsConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_DRAIN_TIMEOUT));
    });
    if let Err(e) = axum_server::from_tcp_rustls(listener, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
    {
        warn!(err = %e, "TLS listener exited with error");
    }
}

async fn relay_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        peer::run(socket, state.store, state.metrics, state.validator, state.exposed_address).await;
    })
}

async fn serve_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            listen_address: addr,
            tls_cert_file: None,
            tls_key_file: None,
            exposed_address: "rels://127.0.0.1:0".to_string(),
            auth_secret: "test-secret".to_string(),
            metrics_listen_address: None,
            token_validity_secs: 3600,
        }
    }

    #[test]
    fn server_new_builds_without_panicking() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::new(test_config(addr));
        assert_eq!(server.store.len(), 0);
    }
}
