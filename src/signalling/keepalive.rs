//! Signalling keepalive monitor
//!
//! Sends a `ping` every interval. If the pong for the previous ping has
//! not arrived by the time the next one is due, the connection is
//! considered dead and the timeout callback fires once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::OutboundMessage;
use super::transport::SignallingTransport;

/// Callback fired when a pong does not come back in time
pub type KeepaliveTimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Current wall clock in milliseconds
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

pub struct KeepaliveMonitor {
    alive: Arc<AtomicBool>,
    rtt_ms: Arc<Mutex<f64>>,
    cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Start pinging `transport` every `interval`
    pub fn start(
        interval: Duration,
        transport: Arc<dyn SignallingTransport>,
        on_timeout: KeepaliveTimeoutCallback,
    ) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let task_alive = alive.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !task_alive.swap(false, Ordering::SeqCst) {
                            warn!("Keepalive pong not received within {:?}", interval);
                            on_timeout();
                            break;
                        }
                        let ping = OutboundMessage::Ping { time: now_ms() };
                        if let Err(e) = transport.send(ping).await {
                            debug!("Keepalive ping not sent: {}", e);
                        }
                    }
                    _ = task_cancel.cancelled() => break,
                }
            }
        });

        Self {
            alive,
            rtt_ms: Arc::new(Mutex::new(0.0)),
            cancel,
        }
    }

    /// Record a pong carrying the time of the ping it answers
    pub fn on_pong(&self, time: f64) {
        *self.rtt_ms.lock() = (now_ms() - time).max(0.0);
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Round trip time of the last answered ping
    pub fn rtt_ms(&self) -> f64 {
        *self.rtt_ms.lock()
    }

    /// Stop pinging
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
