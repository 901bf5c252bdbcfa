//! Relay pool (spec §4.2): long-lived connections to a configured relay
//! set, built on `nostr_sdk::Client` (which already owns per-relay socket
//! multiplexing) plus a watchdog that detects silent failure and
//! laptop-sleep stalls the way raw TCP keepalives miss.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nostr_sdk::{Client, Event, Filter, Keys, RelayPoolNotification, SubscriptionId};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::error::{SignerError, SignerResult};

/// Cadence for `watchdog_tick`; callers (the daemon binary) drive it on
/// this interval.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const WATCHDOG_FAILURE_THRESHOLD: u32 = 3;
const WATCHDOG_OVERSHOOT_FACTOR: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
}

/// Emitted when the pool tears down and recreates all sockets so the
/// subscription manager can rebuild its managed subscriptions.
#[derive(Debug, Clone)]
pub struct PoolResetEvent;

pub struct RelayPool {
    client: Client,
    relays: Vec<String>,
    reset_tx: broadcast::Sender<PoolResetEvent>,
    consecutive_failures: AtomicU32,
    last_heartbeat: Mutex<Instant>,
}

impl RelayPool {
    pub async fn connect(signing_keys: Keys, relays: Vec<String>) -> SignerResult<Self> {
        let client = Client::new(signing_keys);
        for relay in &relays {
            client
                .add_relay(relay.as_str())
                .await
                .map_err(|e| SignerError::InvalidRelay(format!("{relay}: {e}")))?;
        }
        client.connect().await;
        let (reset_tx, _) = broadcast::channel(16);
        Ok(Self {
            client,
            relays,
            reset_tx,
            consecutive_failures: AtomicU32::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn subscribe_reset(&self) -> broadcast::Receiver<PoolResetEvent> {
        self.reset_tx.subscribe()
    }

    /// Fan out a publish to every configured relay, plus any extra
    /// per-app relays. Succeeds if at least one relay ACKs.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn publish(&self, event: Event, extra_relays: &[String]) -> SignerResult<()> {
        if !extra_relays.is_empty() {
            // Add the extras transiently for this one publish; nostr-sdk
            // fans a plain `send_event` out to every relay the client knows.
            for relay in extra_relays {
                let _ = self.client.add_relay(relay.as_str()).await;
            }
            self.client.connect().await;
        }
        let output = self.client.send_event(event).await;

        match output {
            Ok(out) => {
                if out.success.is_empty() {
                    warn!(failed = out.failed.len(), "publish reached zero relays");
                    Err(SignerError::NoRelayReachable)
                } else {
                    if !out.failed.is_empty() {
                        warn!(succeeded = out.success.len(), failed = out.failed.len(), "publish partially failed");
                    }
                    Ok(())
                }
            }
            Err(e) => {
                warn!(error = %e, "publish failed outright");
                Err(SignerError::NoRelayReachable)
            }
        }
    }

    pub async fn subscribe(&self, filter: Filter) -> SignerResult<SubscriptionId> {
        self.client
            .subscribe(filter, None)
            .await
            .map(|output| output.val)
            .map_err(|e| SignerError::Internal(format!("subscribe failed: {e}")))
    }

    /// Subscribe scoped to a relay subset (spec §4.4: "for each connected
    /// app with custom relays, also opens a per-app subscription on those
    /// relays"). An empty `relays` falls back to the configured set, same
    /// as `subscribe`.
    pub async fn subscribe_on(&self, filter: Filter, relays: &[String]) -> SignerResult<SubscriptionId> {
        if relays.is_empty() {
            return self.subscribe(filter).await;
        }
        for relay in relays {
            let _ = self.client.add_relay(relay.as_str()).await;
        }
        self.client.connect().await;
        self.client
            .subscribe_to(relays.to_vec(), filter, None)
            .await
            .map(|output| output.val)
            .map_err(|e| SignerError::Internal(format!("subscribe_to failed: {e}")))
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        self.client.unsubscribe(id).await;
    }

    /// Drives `client.handle_notifications`, invoking `on_event` for each
    /// delivered event. Runs until the client shuts down; callers spawn
    /// this as its own task.
    pub async fn run_notifications<F>(&self, mut on_event: F) -> SignerResult<()>
    where
        F: FnMut(SubscriptionId, Event) + Send,
    {
        self.client
            .handle_notifications(|notification| async {
                if let RelayPoolNotification::Event { event, subscription_id, .. } = notification {
                    on_event(subscription_id, *event);
                }
                Ok(false)
            })
            .await
            .map_err(|e| SignerError::Internal(format!("notification loop ended: {e}")))
    }

    pub async fn status(&self) -> Vec<RelayStatus> {
        let relays = self.client.relays().await;
        relays
            .into_iter()
            .map(|(url, relay)| RelayStatus {
                url: url.to_string(),
                connected: relay.is_connected(),
            })
            .collect()
    }

    /// Opportunistic wake-up: ensure all configured relays are connected.
    pub async fn ensure_connected(&self) {
        self.client.connect().await;
    }

    /// Tear down and recreate every socket, announcing the reset on the
    /// internal channel so the subscription manager rebuilds.
    #[instrument(skip(self))]
    pub async fn reset(&self) {
        warn!("resetting relay pool");
        self.client.disconnect().await;
        for relay in &self.relays {
            let _ = self.client.add_relay(relay.as_str()).await;
        }
        self.client.connect().await;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_heartbeat.lock().await = Instant::now();
        let _ = self.reset_tx.send(PoolResetEvent);
    }

    /// One watchdog tick (spec §4.2): call this every `WATCHDOG_INTERVAL`
    /// from a background task. Three consecutive failed ticks (well inside
    /// the spec's 5-minute window at a 30s cadence) force a reset; so does
    /// a single overshoot ≥3x the expected interval (the process was
    /// descheduled — laptop sleep).
    #[instrument(skip(self))]
    pub async fn watchdog_tick(&self) {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_heartbeat.lock().await;
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };

        if elapsed >= WATCHDOG_INTERVAL * WATCHDOG_OVERSHOOT_FACTOR {
            warn!(?elapsed, "watchdog overshoot detected, likely sleep/wake; resetting pool");
            self.reset().await;
            return;
        }

        let healthy = self.status().await.iter().any(|r| r.connected);
        if healthy {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= WATCHDOG_FAILURE_THRESHOLD {
            warn!(failures, "watchdog failure threshold reached; resetting pool");
            self.reset().await;
        }
    }

    pub fn configured_relays(&self) -> &[String] {
        &self.relays
    }
}

/// Exponential backoff sequence for reconnection attempts: 1s, 2s, 4s, ...
/// capped at 30s. Exposed standalone so both the pool's own reconnect loop
/// and tests can drive it without a live client.
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current: BACKOFF_INITIAL }
    }
}

impl Backoff {
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * BACKOFF_MULTIPLIER, BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::default();
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.next(), BACKOFF_CAP);
    }

    #[test]
    fn backoff_reset_returns_to_initial() {
        let mut b = Backoff::default();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), BACKOFF_INITIAL);
    }
}
