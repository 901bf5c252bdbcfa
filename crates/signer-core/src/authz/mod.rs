//! Authorization engine (spec §4.5): the policy decision point consulted by
//! the RPC Backend on every inbound request.

pub mod cache;

use std::sync::Arc;

use crate::bus::{DomainEvent, EventBus};
use crate::error::{SignerError, SignerResult};
use crate::store::{Repository, TrustLevel};

use cache::DecisionCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Manual,
    AutoTrust,
    AutoPermission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve(ApprovalKind),
    Deny(String),
    Prompt,
}

/// Safe kinds: `reasonable` trust auto-approves `sign_event` for these
/// (spec §4.5).
pub const SAFE_KINDS: &[u64] = &[
    1, 6, 7, 16, 1111, 9735, 30023, 24242,
    10000, 10001, 10003, 10004, 10005, 10006, 10007, 10015, 10030,
    30000, 30001, 30002, 30003, 30004, 30015,
];

/// Sensitive kinds: always prompt under `reasonable` trust.
pub const SENSITIVE_KINDS: &[u64] = &[0, 3, 4, 5, 10002, 13194, 23194, 23195, 22242, 24133];

pub fn is_safe_kind(kind: u64) -> bool {
    SAFE_KINDS.contains(&kind)
}

pub fn is_sensitive_kind(kind: u64) -> bool {
    SENSITIVE_KINDS.contains(&kind)
}

pub struct AuthorizationEngine {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    cache: Arc<DecisionCache>,
}

impl AuthorizationEngine {
    pub fn new(repo: Arc<dyn Repository>, bus: EventBus, cache: Arc<DecisionCache>) -> Self {
        Self { repo, bus, cache }
    }

    /// Single entry point (spec §4.5). `event_kind` is `Some` only for
    /// `sign_event` requests, where the decision can depend on it.
    pub async fn authorize(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        event_kind: Option<u64>,
    ) -> SignerResult<Decision> {
        // The cache key is (keyName, remotePubkey) only (spec §4.5), but the
        // "no app row yet" outcome depends on `method` (deny vs. prompt for
        // `connect`) — caching it would let an unrelated method's decision
        // leak onto the next `connect` attempt from a first-contact app.
        // There's also no app identity worth memoizing before one exists, so
        // this path is never cached.
        if self.repo.get_app(key_name, remote_pubkey).await?.is_none() {
            return Ok(if method == "connect" {
                Decision::Prompt
            } else {
                Decision::Deny("unknown app".into())
            });
        }

        if let Some(cached) = self.cache.get(key_name, remote_pubkey).await {
            return Ok(cached);
        }

        let decision = self.evaluate(key_name, remote_pubkey, method, event_kind).await?;
        self.cache.put(key_name, remote_pubkey, decision.clone()).await;
        Ok(decision)
    }

    async fn evaluate(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        event_kind: Option<u64>,
    ) -> SignerResult<Decision> {
        let app = self
            .repo
            .get_app(key_name, remote_pubkey)
            .await?
            .ok_or_else(|| SignerError::Internal("app vanished between authorize checks".into()))?;

        let now = now_unix();
        if app.is_suspended(now) {
            return Ok(Decision::Deny("app suspended".into()));
        }

        if let Some(perm) = self.repo.find_permission(key_name, remote_pubkey, method, event_kind).await? {
            return Ok(if perm.allowed {
                Decision::Approve(ApprovalKind::AutoPermission)
            } else {
                Decision::Deny("permission revoked".into())
            });
        }

        Ok(match app.trust_level {
            TrustLevel::Paranoid => Decision::Prompt,
            TrustLevel::Full => Decision::Approve(ApprovalKind::AutoTrust),
            TrustLevel::Reasonable => {
                if method == "sign_event" {
                    match event_kind {
                        Some(kind) if is_safe_kind(kind) => Decision::Approve(ApprovalKind::AutoTrust),
                        _ => Decision::Prompt,
                    }
                } else if method == "get_public_key" || method == "ping" {
                    Decision::Approve(ApprovalKind::AutoTrust)
                } else {
                    Decision::Prompt
                }
            }
        })
    }

    pub async fn invalidate(&self, key_name: &str, remote_pubkey: &str) {
        self.cache.invalidate(key_name, remote_pubkey).await;
        self.bus.publish(DomainEvent::AppUpdated {
            key_name: key_name.to_string(),
            remote_pubkey: remote_pubkey.to_string(),
        });
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
    use crate::store::{App, TrustLevel};

    async fn engine_with_app(trust: TrustLevel, suspended: bool) -> (AuthorizationEngine, crate::context::SignerContext) {
        let ctx = fresh_context();
        let app = App {
            key_name: "alice".into(),
            remote_pubkey: "pk1".into(),
            description: None,
            trust_level: trust,
            custom_relays: vec![],
            suspended_at: if suspended { Some(1) } else { None },
            suspend_until: None,
            created_at: 0,
            last_used_at: 0,
            revoked_at: None,
        };
        ctx.repo.upsert_app(&app).await.unwrap();
        let engine = AuthorizationEngine::new(ctx.repo.clone(), ctx.bus.clone(), ctx.decision_cache.clone());
        (engine, ctx)
    }

    #[tokio::test]
    async fn unknown_app_denies_except_connect() {
        let ctx = fresh_context();
        let engine = AuthorizationEngine::new(ctx.repo.clone(), ctx.bus.clone(), ctx.decision_cache.clone());
        assert_eq!(
            engine.authorize("alice", "ghost", "sign_event", Some(1)).await.unwrap(),
            Decision::Deny("unknown app".into())
        );
        assert_eq!(engine.authorize("alice", "ghost", "connect", None).await.unwrap(), Decision::Prompt);
    }

    #[tokio::test]
    async fn full_trust_never_prompts() {
        let (engine, _ctx) = engine_with_app(TrustLevel::Full, false).await;
        for (method, kind) in [("sign_event", Some(0)), ("nip04_decrypt", None), ("get_public_key", None)] {
            let d = engine.authorize("alice", "pk1", method, kind).await.unwrap();
            assert!(matches!(d, Decision::Approve(ApprovalKind::AutoTrust)));
        }
    }

    #[tokio::test]
    async fn paranoid_always_prompts() {
        let (engine, _ctx) = engine_with_app(TrustLevel::Paranoid, false).await;
        let d = engine.authorize("alice", "pk1", "ping", None).await.unwrap();
        assert_eq!(d, Decision::Prompt);
    }

    #[tokio::test]
    async fn reasonable_auto_approves_safe_kind_and_prompts_sensitive() {
        let (engine, _ctx) = engine_with_app(TrustLevel::Reasonable, false).await;
        let safe = engine.authorize("alice", "pk1", "sign_event", Some(1)).await.unwrap();
        assert!(matches!(safe, Decision::Approve(ApprovalKind::AutoTrust)));

        // cache is keyed per (key,pubkey) not per-method/kind, so use a
        // second app to get a clean evaluation for the sensitive case.
        let ctx = fresh_context();
        let app = crate::store::App {
            key_name: "alice".into(),
            remote_pubkey: "pk2".into(),
            description: None,
            trust_level: TrustLevel::Reasonable,
            custom_relays: vec![],
            suspended_at: None,
            suspend_until: None,
            created_at: 0,
            last_used_at: 0,
            revoked_at: None,
        };
        ctx.repo.upsert_app(&app).await.unwrap();
        let engine2 = AuthorizationEngine::new(ctx.repo.clone(), ctx.bus.clone(), ctx.decision_cache.clone());
        let sensitive = engine2.authorize("alice", "pk2", "sign_event", Some(0)).await.unwrap();
        assert_eq!(sensitive, Decision::Prompt);
    }

    #[tokio::test]
    async fn suspended_app_denies() {
        let (engine, _ctx) = engine_with_app(TrustLevel::Full, true).await;
        let d = engine.authorize("alice", "pk1", "ping", None).await.unwrap();
        assert_eq!(d, Decision::Deny("app suspended".into()));
    }

    #[test]
    fn safe_and_sensitive_kinds_are_disjoint() {
        for k in SAFE_KINDS {
            assert!(!is_sensitive_kind(*k), "kind {k} is in both sets");
        }
    }
}
