//! Per-method dispatch (spec §4.4 table): each handler takes the active
//! key's `Keys` plus the raw string params and returns the `result` string
//! or a `SignerError` to surface as an RPC error response.

use nostr_sdk::nips::{nip04, nip44};
use nostr_sdk::{EventBuilder, Keys, Kind, PublicKey, Tag, Timestamp};
use serde::Deserialize;

use crate::error::{SignerError, SignerResult};

/// The unsigned event skeleton accepted by `sign_event` (spec §4.1 `sign`).
#[derive(Debug, Deserialize)]
struct EventSkeleton {
    kind: u16,
    content: String,
    #[serde(default)]
    tags: Vec<Vec<String>>,
    created_at: Option<i64>,
    #[allow(dead_code)]
    pubkey: Option<String>,
}

pub async fn get_public_key(keys: &Keys) -> SignerResult<String> {
    Ok(keys.public_key().to_hex())
}

pub async fn sign_event(keys: &Keys, params: &[String]) -> SignerResult<String> {
    let raw = params
        .first()
        .ok_or_else(|| SignerError::InvalidInput("sign_event requires an event param".into()))?;
    let skeleton: EventSkeleton =
        serde_json::from_str(raw).map_err(|e| SignerError::InvalidInput(format!("malformed event JSON: {e}")))?;

    let tags: Vec<Tag> = skeleton
        .tags
        .iter()
        .map(Tag::parse)
        .collect::<Result<_, _>>()
        .map_err(|e| SignerError::InvalidInput(format!("malformed tag: {e}")))?;

    let mut unsigned = EventBuilder::new(Kind::from(skeleton.kind), skeleton.content)
        .tags(tags)
        .build(keys.public_key());

    if let Some(created_at) = skeleton.created_at {
        unsigned.created_at = Timestamp::from(created_at.max(0) as u64);
    }

    let event = unsigned
        .sign(keys)
        .await
        .map_err(|e| SignerError::Internal(format!("signing failed: {e}")))?;

    Ok(event.as_json())
}

fn parse_counterparty(params: &[String]) -> SignerResult<PublicKey> {
    let hex = params
        .first()
        .ok_or_else(|| SignerError::InvalidInput("missing counterparty pubkey".into()))?;
    PublicKey::from_hex(hex).map_err(|e| SignerError::InvalidInput(format!("bad pubkey: {e}")))
}

pub async fn nip04_encrypt(keys: &Keys, params: &[String]) -> SignerResult<String> {
    let counterparty = parse_counterparty(params)?;
    let plaintext = params.get(1).ok_or_else(|| SignerError::InvalidInput("missing plaintext".into()))?;
    nip04::encrypt(keys.secret_key(), &counterparty, plaintext)
        .map_err(|e| SignerError::Internal(format!("nip04 encrypt: {e}")))
}

pub async fn nip04_decrypt(keys: &Keys, params: &[String]) -> SignerResult<String> {
    let counterparty = parse_counterparty(params)?;
    let ciphertext = params.get(1).ok_or_else(|| SignerError::InvalidInput("missing ciphertext".into()))?;
    nip04::decrypt(keys.secret_key(), &counterparty, ciphertext)
        .map_err(|e| SignerError::Internal(format!("nip04 decrypt: {e}")))
}

pub async fn nip44_encrypt(keys: &Keys, params: &[String]) -> SignerResult<String> {
    let counterparty = parse_counterparty(params)?;
    let plaintext = params.get(1).ok_or_else(|| SignerError::InvalidInput("missing plaintext".into()))?;
    nip44::encrypt(keys.secret_key(), &counterparty, plaintext, nip44::Version::V2)
        .map_err(|e| SignerError::Internal(format!("nip44 encrypt: {e}")))
}

pub async fn nip44_decrypt(keys: &Keys, params: &[String]) -> SignerResult<String> {
    let counterparty = parse_counterparty(params)?;
    let ciphertext = params.get(1).ok_or_else(|| SignerError::InvalidInput("missing ciphertext".into()))?;
    nip44::decrypt(keys.secret_key(), &counterparty, ciphertext)
        .map_err(|e| SignerError::Internal(format!("nip44 decrypt: {e}")))
}

pub async fn ping() -> SignerResult<String> {
    Ok("pong".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_event_fills_defaults_and_signs() {
        let keys = Keys::generate();
        let raw = r#"{"kind":1,"content":"hello","tags":[]}"#;
        let json = sign_event(&keys, &[raw.to_string()]).await.unwrap();
        let event: nostr_sdk::Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.pubkey, keys.public_key());
        assert!(event.verify().is_ok());
    }

    #[tokio::test]
    async fn nip44_round_trips_between_two_keys() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let ct = nip44_encrypt(&alice, &[bob.public_key().to_hex(), "secret".into()]).await.unwrap();
        let pt = nip44_decrypt(&bob, &[alice.public_key().to_hex(), ct]).await.unwrap();
        assert_eq!(pt, "secret");
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        assert_eq!(ping().await.unwrap(), "pong");
    }
}
