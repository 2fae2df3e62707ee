//! Reconnect supervision for a [`Client`].
//!
//! The relay client itself only connects once and reports disconnection
//! (`Client::set_on_disconnect_listener`); reconnection is deliberately a
//! separate concern layered on top. The retry loop is hand-rolled rather
//! than pulled in from a backoff crate: unbounded retries with a capped
//! exponential backoff, since a relay client is expected to stay connected
//! for the life of the process rather than dial once and give up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::relay::client::Client;

/// Initial delay before the first retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Ceiling on the backoff delay; retries never wait longer than this.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Drives a [`Client`] through repeated `connect` attempts, backing off
/// exponentially (with jitter) between failures, and reconnecting
/// automatically whenever the client reports a disconnect.
pub struct Supervisor {
    client: Arc<Client>,
    stopped: Arc<AtomicBool>,
}

impl Supervisor {
    /// Wraps `client` and immediately spawns the supervising task, which
    /// performs the first connect attempt and then reconnects for as long
    /// as the returned `Supervisor` (or a clone of its stop handle) is
    /// alive.
    pub fn spawn(client: Arc<Client>) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));

        let disconnect_flag = Arc::new(AtomicBool::new(false));
        let listener_flag = disconnect_flag.clone();
        client.set_on_disconnect_listener(move || {
            listener_flag.store(true, Ordering::SeqCst);
        });

        let task_client = client.clone();
        let task_stopped = stopped.clone();
        tokio::spawn(async move {
            loop {
                if task_stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = connect_with_backoff(&task_client, &task_stopped).await {
                    warn!(err = %e, "relay supervisor giving up: stop requested");
                    return;
                }

                // Wait for a disconnect notification (or a stop request),
                // polling at a modest interval; `Client` has no async
                // "wait for disconnect" primitive of its own since a
                // single client may be shared by callers who never want
                // to be woken on disconnect.
                loop {
                    if task_stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    if disconnect_flag.swap(false, Ordering::SeqCst) {
                        info!("relay link dropped, reconnecting");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        });

        Supervisor { client, stopped }
    }

    /// Stops reconnect attempts and closes the underlying client.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.client.close().await;
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }
}

/// Retries `client.connect()` with exponential backoff until it succeeds
/// or `stopped` is set. Returns `Err` only when `stopped` is observed.
async fn connect_with_backoff(
    client: &Arc<Client>,
    stopped: &Arc<AtomicBool>,
) -> Result<(), &'static str> {
    let mut delay = INITIAL_BACKOFF;
    loop {
        if stopped.load(Ordering::SeqCst) {
            return Err("stopped");
        }
        match client.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(err = %e, delay_ms = delay.as_millis(), "relay connect failed, backing off");
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4 + 1);
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_with_backoff_stops_when_flagged() {
        // A client pointed at a port nothing listens on will never
        // connect; setting `stopped` concurrently must unblock the loop
        // instead of retrying forever.
        let client = Client::new(
            "ws://127.0.0.1:1",
            "peer",
            Arc::new(|| Err(crate::relay::error::Error::Closed)),
        );
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_clone = stopped.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_clone.store(true, Ordering::SeqCst);
        });
        let result = connect_with_backoff(&client, &stopped).await;
        assert!(result.is_err());
    }
}
