//! Inactivity lock / "dead man's switch" (spec §4.7): a tamper-resistant
//! timer that panics all custody on expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::bus::{DomainEvent, EventBus};
use crate::error::{SignerError, SignerResult};
use crate::store::{AuditRecordInput, DeadManSwitchState, Repository};
use crate::vault::Vault;

/// Interval for the background check loop; callers drive `check_tick` on
/// this cadence (spec §4.7).
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Warning thresholds before expiry: 7d, 24h, 6h, 1h, 15m, 2m.
pub const WARNING_THRESHOLDS_SEC: &[i64] = &[7 * 86400, 24 * 3600, 6 * 3600, 3600, 15 * 60, 2 * 60];

const RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

/// Tracks passphrase-gated-operation attempts for rate limiting (spec
/// §4.7). The window anchors to the *first* failure in the current run,
/// not refreshed per attempt, so spacing out attempts cannot evade it.
struct RateLimitState {
    failures: u32,
    window_started_at: Option<std::time::Instant>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self { failures: 0, window_started_at: None }
    }
}

pub struct InactivityLock {
    repo: Arc<dyn Repository>,
    vault: Arc<Vault>,
    bus: EventBus,
    rate_limit: Mutex<RateLimitState>,
}

impl InactivityLock {
    pub fn new(repo: Arc<dyn Repository>, vault: Arc<Vault>, bus: EventBus) -> Self {
        Self { repo, vault, bus, rate_limit: Mutex::new(RateLimitState::default()) }
    }

    async fn check_rate_limit(&self) -> SignerResult<()> {
        let mut state = self.rate_limit.lock().await;
        if let Some(started) = state.window_started_at {
            if started.elapsed() >= RATE_LIMIT_WINDOW {
                state.failures = 0;
                state.window_started_at = None;
            } else if state.failures >= RATE_LIMIT_MAX_ATTEMPTS {
                let retry_after = RATE_LIMIT_WINDOW.saturating_sub(started.elapsed()).as_secs();
                return Err(SignerError::RateLimited { retry_after_secs: retry_after });
            }
        }
        Ok(())
    }

    async fn record_attempt_result(&self, success: bool) {
        let mut state = self.rate_limit.lock().await;
        if success {
            state.failures = 0;
            state.window_started_at = None;
        } else {
            if state.window_started_at.is_none() {
                state.window_started_at = Some(std::time::Instant::now());
            }
            state.failures += 1;
        }
    }

    async fn verify_passphrase_rate_limited(&self, key_name: &str, passphrase: &str) -> SignerResult<()> {
        self.check_rate_limit().await?;
        let ok = self.vault.verify_passphrase(key_name, passphrase).await.is_ok();
        self.record_attempt_result(ok).await;
        if ok {
            Ok(())
        } else {
            Err(SignerError::WrongPassphrase)
        }
    }

    pub async fn enable(&self, timeframe_sec: i64, has_encrypted_key: bool) -> SignerResult<()> {
        if !has_encrypted_key {
            return Err(SignerError::InvalidInput(
                "dead man's switch requires at least one encrypted key".into(),
            ));
        }
        let state = DeadManSwitchState {
            enabled: true,
            timeframe_sec,
            last_reset_at: now_unix(),
            panic_triggered_at: None,
            warnings_sent: Vec::new(),
        };
        self.repo.put_deadman_state(&state).await?;
        self.bus.publish(DomainEvent::DeadmanUpdated);
        Ok(())
    }

    pub async fn disable(&self, key_name: &str, passphrase: &str) -> SignerResult<()> {
        self.verify_passphrase_rate_limited(key_name, passphrase).await?;
        let mut state = self.repo.get_deadman_state().await?;
        state.enabled = false;
        self.repo.put_deadman_state(&state).await?;
        self.bus.publish(DomainEvent::DeadmanUpdated);
        Ok(())
    }

    pub async fn reset(&self, key_name: &str, passphrase: &str) -> SignerResult<()> {
        self.verify_passphrase_rate_limited(key_name, passphrase).await?;
        let mut state = self.repo.get_deadman_state().await?;
        state.last_reset_at = now_unix();
        let was_panicked = state.panic_triggered_at.take().is_some();
        state.warnings_sent.clear();
        self.repo.put_deadman_state(&state).await?;
        if was_panicked {
            self.vault.unlock(key_name, passphrase).await?;
        }
        self.bus.publish(DomainEvent::DeadmanReset);
        Ok(())
    }

    pub async fn update_timeframe(&self, key_name: &str, passphrase: &str, timeframe_sec: i64) -> SignerResult<()> {
        self.verify_passphrase_rate_limited(key_name, passphrase).await?;
        let mut state = self.repo.get_deadman_state().await?;
        state.timeframe_sec = timeframe_sec;
        self.repo.put_deadman_state(&state).await?;
        self.bus.publish(DomainEvent::DeadmanUpdated);
        Ok(())
    }

    /// One 60s check-loop tick. Evaluates remaining time, crosses warning
    /// thresholds, and triggers panic on expiry.
    #[instrument(skip(self))]
    pub async fn check_tick(&self) -> SignerResult<()> {
        let mut state = self.repo.get_deadman_state().await?;
        if !state.enabled || state.panic_triggered_at.is_some() {
            return Ok(());
        }

        let now = now_unix();
        let remaining = state.timeframe_sec - (now - state.last_reset_at);

        if remaining <= 0 {
            self.trigger_panic(&mut state).await?;
            return Ok(());
        }

        for &threshold in WARNING_THRESHOLDS_SEC {
            if remaining <= threshold && !state.warnings_sent.contains(&threshold) {
                state.warnings_sent.push(threshold);
                self.bus.log("warn", format!("dead man's switch: {remaining}s remaining"));
            }
        }
        self.repo.put_deadman_state(&state).await?;
        Ok(())
    }

    #[instrument(skip(self, state))]
    async fn trigger_panic(&self, state: &mut DeadManSwitchState) -> SignerResult<()> {
        warn!("dead man's switch expired; panicking custody");

        self.vault.lock_all().await;

        if let Err(e) = self.repo.suspend_all_apps(now_unix()).await {
            warn!(error = %e, "failed to suspend apps during panic");
        }

        state.panic_triggered_at = Some(now_unix());
        self.repo.put_deadman_state(state).await?;

        let _ = self
            .repo
            .append_audit(&AuditRecordInput {
                key_name: None,
                kind: "panic_triggered".into(),
                detail: "inactivity lock expired".into(),
            })
            .await;

        self.bus.publish(DomainEvent::DeadmanPanic);
        self.bus.publish(DomainEvent::StatsUpdated);
        Ok(())
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::fresh_context;

    #[tokio::test]
    async fn expiry_locks_keys_and_suspends_apps() {
        let ctx = fresh_context();
        ctx.vault.generate("alice", "pw").await.unwrap();

        let lock = InactivityLock::new(ctx.repo.clone(), ctx.vault.clone(), ctx.bus.clone());
        lock.enable(120, true).await.unwrap();

        let app = crate::store::App {
            key_name: "alice".into(),
            remote_pubkey: "pk1".into(),
            description: None,
            trust_level: crate::store::TrustLevel::Full,
            custom_relays: vec![],
            suspended_at: None,
            suspend_until: None,
            created_at: now_unix(),
            last_used_at: now_unix(),
            revoked_at: None,
        };
        ctx.repo.upsert_app(&app).await.unwrap();

        // Force expiry by rewinding last_reset_at.
        let mut state = ctx.repo.get_deadman_state().await.unwrap();
        state.last_reset_at = now_unix() - 121;
        ctx.repo.put_deadman_state(&state).await.unwrap();

        lock.check_tick().await.unwrap();

        assert!(ctx.vault.active_keys("alice").await.is_err());
        let app_after = ctx.repo.get_app("alice", "pk1").await.unwrap().unwrap();
        assert!(app_after.suspended_at.is_some());

        let final_state = ctx.repo.get_deadman_state().await.unwrap();
        assert!(final_state.panic_triggered_at.is_some());
    }

    #[tokio::test]
    async fn rate_limit_blocks_sixth_attempt_within_window() {
        let ctx = fresh_context();
        ctx.vault.generate("bob", "correct").await.unwrap();
        let lock = InactivityLock::new(ctx.repo.clone(), ctx.vault.clone(), ctx.bus.clone());

        for _ in 0..5 {
            assert!(lock.verify_passphrase_rate_limited("bob", "wrong").await.is_err());
        }
        match lock.verify_passphrase_rate_limited("bob", "correct").await {
            Err(SignerError::RateLimited { .. }) => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
