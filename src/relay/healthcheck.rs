//! Symmetric ping/timeout keepalive, used by both the server-side `Peer`
//! (as a [`Sender`]) and the client-side link reader (as a [`Receiver`]).

use std::time::Duration;

use tokio::time::{interval, Instant};

/// How often the sender side emits a healthcheck request.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
/// How long the sender waits for a response before timing out.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(20);
/// How long the receiver waits for an incoming healthcheck before timing
/// out. Longer than the sender's interval plus a typical RTT.
pub const RECEIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// The initiating side of the health-check protocol. Emits a `HealthCheck`
/// (via [`Sender::tick`]) every [`HEARTBEAT_INTERVAL`]; the caller is
/// responsible for actually writing the frame to the wire. If no response
/// is observed (via [`Sender::on_response`]) within [`HEALTH_CHECK_TIMEOUT`]
/// of the last tick, [`Sender::timeout`] resolves exactly once.
pub struct Sender {
    tick: tokio::time::Interval,
    last_response: Instant,
    fired: bool,
}

impl Sender {
    pub fn new() -> Self {
        let mut tick = interval(HEARTBEAT_INTERVAL);
        tick.reset();
        Sender {
            tick,
            last_response: Instant::now(),
            fired: false,
        }
    }

    /// Call whenever a healthcheck response arrives from the peer.
    pub fn on_response(&mut self) {
        self.last_response = Instant::now();
    }

    /// Drives the engine: waits for the next tick. Returns `true` when the
    /// caller should emit a healthcheck frame, `false` when the timeout
    /// has fired (terminal — the caller should stop calling `poll` and
    /// tear down the link).
    pub async fn poll(&mut self) -> bool {
        if self.fired {
            std::future::pending::<()>().await;
            unreachable!()
        }
        self.tick.tick().await;
        if self.last_response.elapsed() > HEALTH_CHECK_TIMEOUT {
            self.fired = true;
            return false;
        }
        true
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

/// The responding side. Reset on every incoming healthcheck via
/// [`Receiver::heartbeat`]; if [`RECEIVER_TIMEOUT`] elapses without one,
/// [`Receiver::wait_timeout`] resolves exactly once.
pub struct Receiver {
    last_heartbeat: Instant,
}

impl Receiver {
    pub fn new() -> Self {
        Receiver {
            last_heartbeat: Instant::now(),
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Sleeps until either `RECEIVER_TIMEOUT` has elapsed since the last
    /// heartbeat, or returns immediately if it already has. Intended to be
    /// raced against the link's read future in a `tokio::select!`, and
    /// called again (it re-reads `last_heartbeat`) after every heartbeat.
    pub async fn wait_timeout(&self) {
        loop {
            let elapsed = self.last_heartbeat.elapsed();
            if elapsed >= RECEIVER_TIMEOUT {
                return;
            }
            tokio::time::sleep(RECEIVER_TIMEOUT - elapsed).await;
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn receiver_times_out_without_heartbeats() {
        let rx = Receiver::new();
        tokio::time::advance(RECEIVER_TIMEOUT + Duration::from_millis(1)).await;
        tokio::time::timeout(Duration::from_millis(10), rx.wait_timeout())
            .await
            .expect("receiver should have timed out");
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_does_not_time_out_with_heartbeats() {
        let mut rx = Receiver::new();
        tokio::time::advance(RECEIVER_TIMEOUT / 2).await;
        rx.heartbeat();
        let result = tokio::time::timeout(RECEIVER_TIMEOUT / 2, rx.wait_timeout()).await;
        assert!(result.is_err(), "should not have timed out yet");
    }

    #[tokio::test(start_paused = true)]
    async fn sender_fires_timeout_exactly_once_without_responses() {
        let mut tx = Sender::new();
        tokio::time::advance(HEARTBEAT_INTERVAL).await;
        assert!(tx.poll().await, "first tick should just ask for a ping");
        tokio::time::advance(HEARTBEAT_INTERVAL + HEALTH_CHECK_TIMEOUT + Duration::from_secs(1))
            .await;
        assert!(!tx.poll().await, "second tick should observe the timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn sender_does_not_time_out_when_responses_keep_arriving() {
        let mut tx = Sender::new();
        for _ in 0..3 {
            tokio::time::advance(HEARTBEAT_INTERVAL).await;
            assert!(tx.poll().await);
            tx.on_response();
        }
    }
}
