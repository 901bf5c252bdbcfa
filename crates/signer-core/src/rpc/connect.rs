//! `connect` handshake (spec §4.4.1): token or admin-secret match, then a
//! normal authorization-flow pass to actually create the `App` row.

use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::SignerResult;
use crate::store::{App, Repository, SavedPermission, TrustLevel};

/// A policy template bound to a `ConnectionToken`: the trust level and any
/// permissions to pre-install on successful connect. Stored as the token's
/// `policy_template` column, serialized as JSON.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PolicyTemplate {
    #[serde(default = "default_trust_level")]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub permissions: Vec<TemplatePermission>,
}

fn default_trust_level() -> TrustLevel {
    TrustLevel::Reasonable
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TemplatePermission {
    pub method: String,
    pub kind: Option<u64>,
    pub allowed: bool,
}

impl Default for PolicyTemplate {
    fn default() -> Self {
        Self { trust_level: TrustLevel::Reasonable, permissions: Vec::new() }
    }
}

pub enum SecretCheck {
    /// `connect` carried no `secret` param; proceed straight to the
    /// ordinary authorization flow.
    NotProvided,
    /// Matched a token or the admin secret; apply `template` on approval.
    Matched { template: PolicyTemplate },
    /// Secret present but matched neither a token nor the admin secret.
    /// Per spec §4.4.1 the caller must drop the request with no response.
    Rejected,
}

/// Check `secret` against this key's connection tokens, then its durable
/// admin secret, in that order (spec §4.4.1).
pub async fn check_secret(
    repo: &Arc<dyn Repository>,
    key_name: &str,
    admin_secret: Option<&str>,
    secret: Option<&str>,
    now: i64,
) -> SignerResult<SecretCheck> {
    let Some(secret) = secret else {
        return Ok(SecretCheck::NotProvided);
    };

    if let Some(token) = repo.get_token(secret).await? {
        if token.key_name == key_name && token.is_usable(now) && repo.claim_token(secret, now).await? {
            let template = token
                .policy_template
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            return Ok(SecretCheck::Matched { template });
        }
    }

    if let Some(admin_secret) = admin_secret {
        if !admin_secret.is_empty() && constant_time_eq(admin_secret.as_bytes(), secret.as_bytes()) {
            return Ok(SecretCheck::Matched { template: PolicyTemplate::default() });
        }
    }

    Ok(SecretCheck::Rejected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// On approval, upsert the `App` row and install any templated permissions.
pub async fn finalize(
    repo: &Arc<dyn Repository>,
    key_name: &str,
    remote_pubkey: &str,
    template: &PolicyTemplate,
    app_relays: Vec<String>,
    now: i64,
) -> SignerResult<()> {
    let app = App {
        key_name: key_name.to_string(),
        remote_pubkey: remote_pubkey.to_string(),
        description: None,
        trust_level: template.trust_level,
        custom_relays: app_relays,
        suspended_at: None,
        suspend_until: None,
        revoked_at: None,
        created_at: now,
        last_used_at: now,
    };
    repo.upsert_app(&app).await?;

    for perm in &template.permissions {
        repo.upsert_permission(&SavedPermission {
            key_name: key_name.to_string(),
            remote_pubkey: remote_pubkey.to_string(),
            method: perm.method.clone(),
            kind: perm.kind,
            allowed: perm.allowed,
        })
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::fresh_context;
    use crate::store::ConnectionToken;

    #[tokio::test]
    async fn token_match_claims_and_is_single_use() {
        let ctx = fresh_context();
        ctx.repo
            .create_token(&ConnectionToken {
                token: "tok1".into(),
                key_name: "alice".into(),
                issued_at: 0,
                expires_at: 1000,
                redeemed_at: None,
                policy_template: None,
            })
            .await
            .unwrap();

        let first = check_secret(&ctx.repo, "alice", None, Some("tok1"), 10).await.unwrap();
        assert!(matches!(first, SecretCheck::Matched { .. }));

        let second = check_secret(&ctx.repo, "alice", None, Some("tok1"), 10).await.unwrap();
        assert!(matches!(second, SecretCheck::Rejected));
    }

    #[tokio::test]
    async fn admin_secret_matches_when_token_absent() {
        let ctx = fresh_context();
        let outcome = check_secret(&ctx.repo, "alice", Some("shhh"), Some("shhh"), 10).await.unwrap();
        assert!(matches!(outcome, SecretCheck::Matched { .. }));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_silently() {
        let ctx = fresh_context();
        let outcome = check_secret(&ctx.repo, "alice", Some("shhh"), Some("guess"), 10).await.unwrap();
        assert!(matches!(outcome, SecretCheck::Rejected));
    }

    #[tokio::test]
    async fn no_secret_continues_to_normal_flow() {
        let ctx = fresh_context();
        let outcome = check_secret(&ctx.repo, "alice", Some("shhh"), None, 10).await.unwrap();
        assert!(matches!(outcome, SecretCheck::NotProvided));
    }
}
