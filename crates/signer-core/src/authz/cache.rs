//! Decision cache (spec §4.5): short-TTL memoization of `authorize` results
//! keyed by `(keyName, remotePubkey)`, invalidated on any app/permission
//! mutation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::Decision;

const TTL: Duration = Duration::from_secs(30);
const MAX_ENTRIES: usize = 1_000;

struct CachedDecision {
    decision: Decision,
    inserted_at: Instant,
}

#[derive(Default)]
pub struct DecisionCache {
    entries: Mutex<HashMap<(String, String), CachedDecision>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key_name: &str, remote_pubkey: &str) -> Option<Decision> {
        let mut entries = self.entries.lock().await;
        let key = (key_name.to_string(), remote_pubkey.to_string());
        match entries.get(&key) {
            Some(cached) if cached.inserted_at.elapsed() < TTL => Some(cached.decision.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key_name: &str, remote_pubkey: &str, decision: Decision) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= MAX_ENTRIES {
            // Evict an arbitrary stale-looking entry rather than growing
            // unbounded; a full LRU is more machinery than a 1k-entry,
            // 30s-TTL cache warrants.
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        entries.insert(
            (key_name.to_string(), remote_pubkey.to_string()),
            CachedDecision { decision, inserted_at: Instant::now() },
        );
    }

    pub async fn invalidate(&self, key_name: &str, remote_pubkey: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(&(key_name.to_string(), remote_pubkey.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::ApprovalKind;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = DecisionCache::new();
        cache.put("alice", "pk1", Decision::Approve(ApprovalKind::AutoTrust)).await;
        assert!(matches!(cache.get("alice", "pk1").await, Some(Decision::Approve(_))));
    }

    #[tokio::test]
    async fn invalidate_clears_entry() {
        let cache = DecisionCache::new();
        cache.put("alice", "pk1", Decision::Prompt).await;
        cache.invalidate("alice", "pk1").await;
        assert!(cache.get("alice", "pk1").await.is_none());
    }
}
