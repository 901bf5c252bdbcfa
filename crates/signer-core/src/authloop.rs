//! Request authorization loop (spec §4.6): persists "needs human" requests
//! and awaits a decision with exponential backoff.

use std::time::Duration;

use tokio::time::Instant;
use tracing::instrument;

use crate::bus::{DomainEvent, EventBus};
use crate::error::{SignerError, SignerResult};
use crate::store::{PendingRequest, Repository};

const REQUEST_TTL: Duration = Duration::from_secs(60);
const POLL_INITIAL: Duration = Duration::from_millis(100);
const POLL_MULTIPLIER: f64 = 1.5;
const POLL_CAP: Duration = Duration::from_secs(2);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(65);

pub struct AuthorizationLoop {
    repo: std::sync::Arc<dyn Repository>,
    bus: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Denied,
    /// The 60s request TTL elapsed with `decision` still null (spec §8
    /// boundary behavior) or the overall 65s poll deadline was hit.
    TimedOut,
    ShuttingDown,
}

impl AuthorizationLoop {
    pub fn new(repo: std::sync::Arc<dyn Repository>, bus: EventBus) -> Self {
        Self { repo, bus }
    }

    /// Insert the pending request, then poll for a decision. Returns once
    /// a decision is written, the request expires, or `shutdown` resolves.
    #[instrument(skip(self, shutdown), fields(request_id = %req.request_id))]
    pub async fn run(
        &self,
        req: PendingRequest,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> SignerResult<Outcome> {
        self.repo.insert_pending_request(&req).await?;
        self.bus.publish(DomainEvent::RequestCreated {
            request_id: req.request_id.clone(),
            key_name: req.key_name.clone(),
            remote_pubkey: req.remote_pubkey.clone(),
            method: req.method.clone(),
        });

        tokio::pin!(shutdown);
        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let mut interval = POLL_INITIAL;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    return Ok(Outcome::ShuttingDown);
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if Instant::now() >= deadline {
                self.bus.publish(DomainEvent::RequestExpired { request_id: req.request_id.clone() });
                return Ok(Outcome::TimedOut);
            }

            match self.repo.get_pending_request(&req.request_id).await? {
                Some(row) => match row.decision {
                    Some(true) => {
                        self.bus.publish(DomainEvent::RequestApproved { request_id: req.request_id.clone() });
                        return Ok(Outcome::Approved);
                    }
                    Some(false) => {
                        self.bus.publish(DomainEvent::RequestDenied {
                            request_id: req.request_id.clone(),
                            reason: "denied by policy decision".into(),
                        });
                        return Ok(Outcome::Denied);
                    }
                    None => {
                        if elapsed_since(req.created_at) >= REQUEST_TTL.as_secs() {
                            self.bus.publish(DomainEvent::RequestExpired { request_id: req.request_id.clone() });
                            return Ok(Outcome::TimedOut);
                        }
                    }
                },
                None => {
                    return Err(SignerError::Internal("pending request vanished during poll".into()));
                }
            }

            interval = std::cmp::min(
                Duration::from_secs_f64(interval.as_secs_f64() * POLL_MULTIPLIER),
                POLL_CAP,
            );
        }
    }
}

fn elapsed_since(created_at: i64) -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(created_at);
    (now - created_at).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::fresh_context;

    fn sample_request(id: &str) -> PendingRequest {
        PendingRequest {
            request_id: id.into(),
            key_name: "alice".into(),
            remote_pubkey: "pk1".into(),
            method: "sign_event".into(),
            params_json: "[]".into(),
            created_at: now(),
            decision: None,
            decided_at: None,
            approval_type: None,
        }
    }

    fn now() -> i64 {
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64
    }

    #[tokio::test]
    async fn approval_written_mid_poll_is_observed() {
        let ctx = fresh_context();
        let auth_loop = AuthorizationLoop::new(ctx.repo.clone(), ctx.bus.clone());
        let req = sample_request("r1");

        let repo = ctx.repo.clone();
        let request_id = req.request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            repo.decide_pending_request(&request_id, true, now()).await.unwrap();
        });

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx);
        let shutdown = async move {
            let _ = rx.await;
            std::future::pending::<()>().await;
        };
        let outcome = auth_loop.run(req, shutdown).await.unwrap();
        assert_eq!(outcome, Outcome::Approved);
    }

    #[tokio::test]
    async fn shutdown_signal_short_circuits() {
        let ctx = fresh_context();
        let auth_loop = AuthorizationLoop::new(ctx.repo.clone(), ctx.bus.clone());
        let req = sample_request("r2");
        let outcome = auth_loop.run(req, async {}).await.unwrap();
        assert_eq!(outcome, Outcome::ShuttingDown);
    }
}
