//! Per-active-key RPC backend (spec §4.4): the inbound path from decrypted
//! event to dispatched method to encrypted, published response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::nips::nip44;
use nostr_sdk::{Event, EventBuilder, EventId, Keys, Kind, PublicKey, Tag};
use rand::RngCore;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::authloop::{AuthorizationLoop, Outcome};
use crate::authz::{AuthorizationEngine, Decision};
use crate::bus::{DomainEvent, EventBus};
use crate::error::SignerResult;
use crate::relay::RelayPool;
use crate::rpc::connect::{self, PolicyTemplate, SecretCheck};
use crate::rpc::methods;
use crate::rpc::{RpcRequest, RpcResponse, NIP46_KIND};
use crate::store::{PendingRequest, Repository};
use crate::vault::Vault;

const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
const DEDUP_MAX_ENTRIES: usize = 5_000;

enum AuthOutcome {
    Approved,
    Denied(String),
    TimedOut,
    ShuttingDown,
    DeferredUrl(String),
}

pub struct RpcBackend {
    key_name: String,
    repo: Arc<dyn Repository>,
    vault: Arc<Vault>,
    pool: Arc<RelayPool>,
    authz: Arc<AuthorizationEngine>,
    auth_loop: Arc<AuthorizationLoop>,
    bus: EventBus,
    dashboard_base_url: Option<String>,
    shutdown: watch::Receiver<bool>,
    seen: Mutex<HashMap<EventId, Instant>>,
}

impl RpcBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_name: String,
        repo: Arc<dyn Repository>,
        vault: Arc<Vault>,
        pool: Arc<RelayPool>,
        authz: Arc<AuthorizationEngine>,
        auth_loop: Arc<AuthorizationLoop>,
        bus: EventBus,
        dashboard_base_url: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key_name,
            repo,
            vault,
            pool,
            authz,
            auth_loop,
            bus,
            dashboard_base_url,
            shutdown,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for the Subscription Manager's `on_event` callback.
    #[instrument(skip(self, event), fields(key = %self.key_name, event_id = %event.id))]
    pub async fn handle_event(&self, event: Event) {
        if event.kind != Kind::Custom(NIP46_KIND as u16) {
            return;
        }
        if !self.mark_seen(event.id).await {
            return;
        }
        if event.verify().is_err() {
            return;
        }

        let keys = match self.vault.active_keys(&self.key_name).await {
            Ok(k) => k,
            Err(_) => return,
        };

        let plaintext = match nip44::decrypt(keys.secret_key(), &event.pubkey, &event.content) {
            Ok(p) => p,
            Err(_) => return,
        };
        let req: RpcRequest = match serde_json::from_str(&plaintext) {
            Ok(r) => r,
            Err(_) => return,
        };

        let remote_pubkey = event.pubkey;
        let extra_relays = self.app_relays(&remote_pubkey).await;

        let response = if req.method == "connect" {
            self.dispatch_connect(&keys, remote_pubkey, &req).await
        } else if req.method == "ping" {
            Some(RpcResponse::ok(req.id.clone(), methods::ping().await.unwrap_or_default()))
        } else {
            self.dispatch_gated(&keys, remote_pubkey, &req).await
        };

        if let Some(response) = response {
            self.send_response(&keys, &remote_pubkey, response, extra_relays).await;
        }
    }

    async fn app_relays(&self, remote_pubkey: &PublicKey) -> Vec<String> {
        self.repo
            .get_app(&self.key_name, &remote_pubkey.to_hex())
            .await
            .ok()
            .flatten()
            .map(|app| app.custom_relays)
            .unwrap_or_default()
    }

    async fn dispatch_connect(&self, keys: &Keys, remote_pubkey: PublicKey, req: &RpcRequest) -> Option<RpcResponse> {
        let remote_hex = remote_pubkey.to_hex();
        let secret = req.params.get(1).cloned();
        let now = now_unix();

        let admin_secret = self.repo.get_key(&self.key_name).await.ok().flatten().and_then(|k| k.admin_secret);

        let check = match connect::check_secret(
            &self.repo,
            &self.key_name,
            admin_secret.as_deref(),
            secret.as_deref(),
            now,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => return Some(RpcResponse::err(req.id.clone(), e.to_string())),
        };

        let template = match check {
            SecretCheck::Rejected => return None,
            SecretCheck::Matched { template } => template,
            SecretCheck::NotProvided => PolicyTemplate::default(),
        };

        let decision = match self.authz.authorize(&self.key_name, &remote_hex, "connect", None).await {
            Ok(d) => d,
            Err(e) => return Some(RpcResponse::err(req.id.clone(), e.to_string())),
        };

        let outcome = match self.resolve(decision, &remote_hex, "connect", &req.params).await {
            Ok(o) => o,
            Err(e) => return Some(RpcResponse::err(req.id.clone(), e.to_string())),
        };

        match outcome {
            AuthOutcome::Approved => {
                if let Err(e) = connect::finalize(&self.repo, &self.key_name, &remote_hex, &template, Vec::new(), now).await {
                    return Some(RpcResponse::err(req.id.clone(), e.to_string()));
                }
                self.bus.publish(DomainEvent::AppConnected { key_name: self.key_name.clone(), remote_pubkey: remote_hex });
                let _ = keys;
                Some(RpcResponse::ok(req.id.clone(), "ack"))
            }
            AuthOutcome::Denied(reason) => Some(RpcResponse::err(req.id.clone(), reason)),
            AuthOutcome::TimedOut => Some(RpcResponse::err(req.id.clone(), "request timed out")),
            AuthOutcome::ShuttingDown => Some(RpcResponse::err(req.id.clone(), "shutting down")),
            AuthOutcome::DeferredUrl(url) => Some(RpcResponse::auth_url(req.id.clone(), url)),
        }
    }

    async fn dispatch_gated(&self, keys: &Keys, remote_pubkey: PublicKey, req: &RpcRequest) -> Option<RpcResponse> {
        let remote_hex = remote_pubkey.to_hex();
        let event_kind = if req.method == "sign_event" { peek_kind(req.params.first()) } else { None };

        let decision = match self.authz.authorize(&self.key_name, &remote_hex, &req.method, event_kind).await {
            Ok(d) => d,
            Err(e) => return Some(RpcResponse::err(req.id.clone(), e.to_string())),
        };

        let outcome = match self.resolve(decision, &remote_hex, &req.method, &req.params).await {
            Ok(o) => o,
            Err(e) => return Some(RpcResponse::err(req.id.clone(), e.to_string())),
        };

        match outcome {
            AuthOutcome::Approved => {
                let _ = self.repo.touch_app_last_used(&self.key_name, &remote_hex, now_unix()).await;
                match self.execute_method(keys, &req.method, &req.params).await {
                    Ok(result) => Some(RpcResponse::ok(req.id.clone(), result)),
                    Err(e) => Some(RpcResponse::err(req.id.clone(), e.to_string())),
                }
            }
            AuthOutcome::Denied(reason) => Some(RpcResponse::err(req.id.clone(), reason)),
            AuthOutcome::TimedOut => Some(RpcResponse::err(req.id.clone(), "request timed out")),
            AuthOutcome::ShuttingDown => Some(RpcResponse::err(req.id.clone(), "shutting down")),
            AuthOutcome::DeferredUrl(url) => Some(RpcResponse::auth_url(req.id.clone(), url)),
        }
    }

    async fn resolve(&self, decision: Decision, remote_hex: &str, method: &str, params: &[String]) -> SignerResult<AuthOutcome> {
        match decision {
            Decision::Approve(_) => Ok(AuthOutcome::Approved),
            Decision::Deny(reason) => Ok(AuthOutcome::Denied(reason)),
            Decision::Prompt => {
                let request_id = generate_request_id();
                let req = PendingRequest {
                    request_id: request_id.clone(),
                    key_name: self.key_name.clone(),
                    remote_pubkey: remote_hex.to_string(),
                    method: method.to_string(),
                    params_json: serde_json::to_string(params).unwrap_or_default(),
                    created_at: now_unix(),
                    decision: None,
                    decided_at: None,
                    approval_type: None,
                };

                if let Some(base) = &self.dashboard_base_url {
                    self.repo.insert_pending_request(&req).await?;
                    self.bus.publish(DomainEvent::RequestCreated {
                        request_id: request_id.clone(),
                        key_name: req.key_name.clone(),
                        remote_pubkey: req.remote_pubkey.clone(),
                        method: req.method.clone(),
                    });
                    return Ok(AuthOutcome::DeferredUrl(format!("{base}/approve/{request_id}")));
                }

                let mut shutdown_rx = self.shutdown.clone();
                let shutdown_fut = async move {
                    let _ = shutdown_rx.wait_for(|done| *done).await;
                };
                match self.auth_loop.run(req, shutdown_fut).await? {
                    Outcome::Approved => Ok(AuthOutcome::Approved),
                    Outcome::Denied => Ok(AuthOutcome::Denied("denied by policy decision".into())),
                    Outcome::TimedOut => Ok(AuthOutcome::TimedOut),
                    Outcome::ShuttingDown => Ok(AuthOutcome::ShuttingDown),
                }
            }
        }
    }

    async fn execute_method(&self, keys: &Keys, method: &str, params: &[String]) -> SignerResult<String> {
        match method {
            "get_public_key" => methods::get_public_key(keys).await,
            "sign_event" => methods::sign_event(keys, params).await,
            "nip04_encrypt" => methods::nip04_encrypt(keys, params).await,
            "nip04_decrypt" => methods::nip04_decrypt(keys, params).await,
            "nip44_encrypt" => methods::nip44_encrypt(keys, params).await,
            "nip44_decrypt" => methods::nip44_decrypt(keys, params).await,
            "ping" => methods::ping().await,
            other => Err(crate::error::SignerError::InvalidInput(format!("unknown method: {other}"))),
        }
    }

    async fn send_response(&self, keys: &Keys, remote_pubkey: &PublicKey, response: RpcResponse, extra_relays: Vec<String>) {
        let body = serde_json::json!({
            "id": response.id,
            "result": response.result,
            "error": response.error,
        });

        let ciphertext = match nip44::encrypt(keys.secret_key(), remote_pubkey, &body.to_string(), nip44::Version::V2) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to encrypt rpc response");
                return;
            }
        };

        let unsigned = EventBuilder::new(Kind::Custom(NIP46_KIND as u16), ciphertext)
            .tag(Tag::public_key(*remote_pubkey))
            .build(keys.public_key());

        let event = match unsigned.sign(keys).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to sign rpc response");
                return;
            }
        };

        if let Err(e) = self.pool.publish(event, &extra_relays).await {
            warn!(error = %e, "failed to publish rpc response");
        }
    }

    async fn mark_seen(&self, id: EventId) -> bool {
        let mut seen = self.seen.lock().await;
        if let Some(at) = seen.get(&id) {
            if at.elapsed() < DEDUP_TTL {
                return false;
            }
        }
        if seen.len() >= DEDUP_MAX_ENTRIES && !seen.contains_key(&id) {
            if let Some(oldest) = seen.iter().min_by_key(|(_, at)| **at).map(|(k, _)| *k) {
                seen.remove(&oldest);
            }
        }
        seen.insert(id, Instant::now());
        true
    }
}

fn peek_kind(raw_event_json: Option<&String>) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(raw_event_json?).ok()?;
    value.get("kind").and_then(|k| k.as_u64())
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
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

    async fn backend_with_generated_key(name: &str) -> (RpcBackend, crate::context::SignerContext, Arc<Keys>) {
        let ctx = fresh_context();
        ctx.vault.generate(name, "pw").await.unwrap();
        let keys = ctx.vault.active_keys(name).await.unwrap();
        let pool = Arc::new(RelayPool::connect((*keys).clone(), vec![]).await.unwrap());
        let authz = Arc::new(AuthorizationEngine::new(ctx.repo.clone(), ctx.bus.clone(), ctx.decision_cache.clone()));
        let auth_loop = Arc::new(AuthorizationLoop::new(ctx.repo.clone(), ctx.bus.clone()));
        let (_tx, rx) = watch::channel(false);
        let backend = RpcBackend::new(
            name.to_string(),
            ctx.repo.clone(),
            ctx.vault.clone(),
            pool,
            authz,
            auth_loop,
            ctx.bus.clone(),
            None,
            rx,
        );
        (backend, ctx, keys)
    }

    #[tokio::test]
    async fn duplicate_event_id_is_dropped() {
        let (backend, _ctx, keys) = backend_with_generated_key("alice").await;
        let event = EventBuilder::new(Kind::TextNote, "hello")
            .build(keys.public_key())
            .sign(&keys)
            .await
            .unwrap();

        assert!(backend.mark_seen(event.id).await);
        assert!(!backend.mark_seen(event.id).await);
    }

    #[test]
    fn peek_kind_extracts_kind_field() {
        let raw = r#"{"kind":1,"content":"x","tags":[]}"#.to_string();
        assert_eq!(peek_kind(Some(&raw)), Some(1));
        assert_eq!(peek_kind(None), None);
    }

    #[tokio::test]
    async fn connect_with_unmatched_secret_yields_no_response() {
        let (backend, ctx, keys) = backend_with_generated_key("alice").await;
        ctx.repo
            .upsert_key(&crate::store::KeyRecord {
                name: "alice".into(),
                public_key_hex: keys.public_key().to_hex(),
                body: crate::store::KeyBody::Plaintext { secret_hex: "0".repeat(64) },
                admin_secret: Some("correct-secret".into()),
            })
            .await
            .unwrap();

        let req = RpcRequest { id: "1".into(), method: "connect".into(), params: vec![keys.public_key().to_hex(), "wrong".into()] };
        let bob = Keys::generate();
        let response = backend.dispatch_connect(&keys, bob.public_key(), &req).await;
        assert!(response.is_none());
    }
}
