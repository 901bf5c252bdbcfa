//! Persistent store: the repository abstraction (spec §3, §6).
//!
//! Every other component talks to durable state only through `Repository`.
//! This keeps the core's concurrency story honest — the sqlite
//! implementation in `sqlite` serializes writes behind a single connection,
//! matching the single-threaded cooperative execution model of §5.

pub mod models;
pub mod sqlite;

use async_trait::async_trait;

pub use models::*;

use crate::error::SignerResult;

/// Abstract durable store. `sqlite::SqliteRepository` is the only
/// implementation shipped; the trait boundary exists so components (and
/// tests) depend on behavior, not on sqlite specifically.
#[async_trait]
pub trait Repository: Send + Sync {
    // Key records
    async fn upsert_key(&self, record: &KeyRecord) -> SignerResult<()>;
    async fn get_key(&self, name: &str) -> SignerResult<Option<KeyRecord>>;
    async fn list_keys(&self) -> SignerResult<Vec<KeyRecord>>;
    async fn rename_key(&self, old_name: &str, new_name: &str) -> SignerResult<()>;
    async fn delete_key(&self, name: &str) -> SignerResult<()>;

    // Apps
    async fn upsert_app(&self, app: &App) -> SignerResult<()>;
    async fn get_app(&self, key_name: &str, remote_pubkey: &str) -> SignerResult<Option<App>>;
    async fn list_apps(&self, key_name: &str) -> SignerResult<Vec<App>>;
    async fn touch_app_last_used(&self, key_name: &str, remote_pubkey: &str, at: i64) -> SignerResult<()>;
    async fn suspend_app(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        at: i64,
        until: Option<i64>,
    ) -> SignerResult<()>;
    async fn suspend_all_apps(&self, at: i64) -> SignerResult<Vec<(String, String)>>;
    async fn revoke_app(&self, key_name: &str, remote_pubkey: &str, at: i64) -> SignerResult<()>;
    async fn revoke_apps_for_key(&self, key_name: &str, at: i64) -> SignerResult<()>;

    // Saved permissions
    async fn upsert_permission(&self, perm: &SavedPermission) -> SignerResult<()>;
    async fn find_permission(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        kind: Option<u64>,
    ) -> SignerResult<Option<SavedPermission>>;

    // Pending requests
    async fn insert_pending_request(&self, req: &PendingRequest) -> SignerResult<()>;
    async fn get_pending_request(&self, request_id: &str) -> SignerResult<Option<PendingRequest>>;
    async fn decide_pending_request(&self, request_id: &str, approved: bool, at: i64) -> SignerResult<()>;

    // Connection tokens
    async fn create_token(&self, token: &ConnectionToken) -> SignerResult<()>;
    async fn get_token(&self, token: &str) -> SignerResult<Option<ConnectionToken>>;
    /// Atomically claims the token iff it is currently unredeemed. Returns
    /// `true` iff this call was the winner of the race (spec §8 "Token
    /// linearity").
    async fn claim_token(&self, token: &str, at: i64) -> SignerResult<bool>;

    // Audit log
    async fn append_audit(&self, record: &AuditRecordInput) -> SignerResult<()>;
    async fn list_audit(
        &self,
        key_name: Option<&str>,
        since: Option<i64>,
        limit: usize,
    ) -> SignerResult<Vec<AuditRecord>>;

    // Dead-man switch
    async fn get_deadman_state(&self) -> SignerResult<DeadManSwitchState>;
    async fn put_deadman_state(&self, state: &DeadManSwitchState) -> SignerResult<()>;

    // Settings key-value store (§11.4)
    async fn get_setting(&self, key: &str) -> SignerResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> SignerResult<()>;
}

/// Input for `append_audit` — `id`/`at` are assigned by the store.
pub struct AuditRecordInput {
    pub key_name: Option<String>,
    pub kind: String,
    pub detail: String,
}
