//! `rusqlite`-backed `Repository` implementation.
//!
//! The teacher pools multiple read connections plus a dedicated write
//! connection to keep a multi-threaded UI responsive. The daemon's
//! single-threaded cooperative execution model (spec §5) has no concurrent
//! readers to serve, so this keeps a single connection behind a
//! `tokio::sync::Mutex` and offloads each query to `spawn_blocking` —
//! `rusqlite::Connection` is blocking I/O end to end.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{SignerError, SignerResult};

use super::models::*;
use super::{AuditRecordInput, Repository};

pub const SQL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS keys (
    name TEXT PRIMARY KEY,
    public_key_hex TEXT NOT NULL,
    body_json TEXT NOT NULL,
    admin_secret TEXT
);

CREATE TABLE IF NOT EXISTS apps (
    key_name TEXT NOT NULL,
    remote_pubkey TEXT NOT NULL,
    description TEXT,
    trust_level TEXT NOT NULL,
    custom_relays TEXT NOT NULL DEFAULT '[]',
    suspended_at INTEGER,
    suspend_until INTEGER,
    revoked_at INTEGER,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    PRIMARY KEY (key_name, remote_pubkey)
);
CREATE INDEX IF NOT EXISTS idx_apps_key ON apps(key_name);

CREATE TABLE IF NOT EXISTS saved_permissions (
    key_name TEXT NOT NULL,
    remote_pubkey TEXT NOT NULL,
    method TEXT NOT NULL,
    kind INTEGER,
    allowed INTEGER NOT NULL,
    PRIMARY KEY (key_name, remote_pubkey, method, kind)
);

CREATE TABLE IF NOT EXISTS pending_requests (
    request_id TEXT PRIMARY KEY,
    key_name TEXT NOT NULL,
    remote_pubkey TEXT NOT NULL,
    method TEXT NOT NULL,
    params_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    decision INTEGER,
    decided_at INTEGER,
    approval_type TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_requests(created_at);

CREATE TABLE IF NOT EXISTS connection_tokens (
    token TEXT PRIMARY KEY,
    key_name TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    redeemed_at INTEGER,
    policy_template TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_name TEXT,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at DESC);
CREATE INDEX IF NOT EXISTS idx_audit_key ON audit_log(key_name);

CREATE TABLE IF NOT EXISTS deadman_state (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    enabled INTEGER NOT NULL,
    timeframe_sec INTEGER NOT NULL,
    last_reset_at INTEGER NOT NULL,
    panic_triggered_at INTEGER,
    warnings_sent TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    pub fn open(path: &Path) -> SignerResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SQL_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> SignerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SQL_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn relays_to_json(relays: &[String]) -> String {
        serde_json::to_string(relays).unwrap_or_else(|_| "[]".into())
    }

    fn relays_from_json(s: &str) -> Vec<String> {
        serde_json::from_str(s).unwrap_or_default()
    }

    fn row_to_app(row: &rusqlite::Row) -> rusqlite::Result<App> {
        let trust_raw: String = row.get("trust_level")?;
        let relays_raw: String = row.get("custom_relays")?;
        Ok(App {
            key_name: row.get("key_name")?,
            remote_pubkey: row.get("remote_pubkey")?,
            description: row.get("description")?,
            trust_level: TrustLevel::parse(&trust_raw).unwrap_or(TrustLevel::Paranoid),
            custom_relays: Self::relays_from_json(&relays_raw),
            suspended_at: row.get("suspended_at")?,
            suspend_until: row.get("suspend_until")?,
            revoked_at: row.get("revoked_at")?,
            created_at: row.get("created_at")?,
            last_used_at: row.get("last_used_at")?,
        })
    }

    fn row_to_pending(row: &rusqlite::Row) -> rusqlite::Result<PendingRequest> {
        let decision: Option<i64> = row.get("decision")?;
        let approval_raw: Option<String> = row.get("approval_type")?;
        Ok(PendingRequest {
            request_id: row.get("request_id")?,
            key_name: row.get("key_name")?,
            remote_pubkey: row.get("remote_pubkey")?,
            method: row.get("method")?,
            params_json: row.get("params_json")?,
            created_at: row.get("created_at")?,
            decision: decision.map(|d| d != 0),
            decided_at: row.get("decided_at")?,
            approval_type: approval_raw.and_then(|s| match s.as_str() {
                "manual" => Some(ApprovalType::Manual),
                "auto_trust" => Some(ApprovalType::AutoTrust),
                "auto_permission" => Some(ApprovalType::AutoPermission),
                _ => None,
            }),
        })
    }

    fn row_to_token(row: &rusqlite::Row) -> rusqlite::Result<ConnectionToken> {
        Ok(ConnectionToken {
            token: row.get("token")?,
            key_name: row.get("key_name")?,
            issued_at: row.get("issued_at")?,
            expires_at: row.get("expires_at")?,
            redeemed_at: row.get("redeemed_at")?,
            policy_template: row.get("policy_template")?,
        })
    }
}

macro_rules! blocking {
    ($conn:expr, $body:expr) => {{
        let conn = $conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            $body(&guard)
        })
        .await
        .map_err(|e| SignerError::Internal(format!("blocking task join: {e}")))?
    }};
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert_key(&self, record: &KeyRecord) -> SignerResult<()> {
        let record = record.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            let body_json = serde_json::to_string(&record.body)?;
            conn.execute(
                "INSERT INTO keys (name, public_key_hex, body_json, admin_secret) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET public_key_hex=excluded.public_key_hex, body_json=excluded.body_json, admin_secret=excluded.admin_secret",
                params![record.name, record.public_key_hex, body_json, record.admin_secret],
            )?;
            Ok(())
        })
    }

    async fn get_key(&self, name: &str) -> SignerResult<Option<KeyRecord>> {
        let name = name.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<KeyRecord>> {
            conn.query_row(
                "SELECT name, public_key_hex, body_json, admin_secret FROM keys WHERE name = ?1",
                params![name],
                |row| {
                    let body_json: String = row.get(2)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, body_json, row.get::<_, Option<String>>(3)?))
                },
            )
            .optional()?
            .map(|(name, public_key_hex, body_json, admin_secret)| {
                let body = serde_json::from_str(&body_json)?;
                Ok(KeyRecord { name, public_key_hex, body, admin_secret })
            })
            .transpose()
        })
    }

    async fn list_keys(&self) -> SignerResult<Vec<KeyRecord>> {
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Vec<KeyRecord>> {
            let mut stmt = conn.prepare("SELECT name, public_key_hex, body_json, admin_secret FROM keys")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, Option<String>>(3)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (name, public_key_hex, body_json, admin_secret) = row?;
                let body = serde_json::from_str(&body_json)?;
                out.push(KeyRecord { name, public_key_hex, body, admin_secret });
            }
            Ok(out)
        })
    }

    async fn rename_key(&self, old_name: &str, new_name: &str) -> SignerResult<()> {
        let (old_name, new_name) = (old_name.to_string(), new_name.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            let tx = conn.unchecked_transaction()?;
            tx.execute("UPDATE keys SET name = ?1 WHERE name = ?2", params![new_name, old_name])?;
            tx.execute("UPDATE apps SET key_name = ?1 WHERE key_name = ?2", params![new_name, old_name])?;
            tx.execute("UPDATE saved_permissions SET key_name = ?1 WHERE key_name = ?2", params![new_name, old_name])?;
            tx.execute("UPDATE pending_requests SET key_name = ?1 WHERE key_name = ?2", params![new_name, old_name])?;
            tx.execute("UPDATE connection_tokens SET key_name = ?1 WHERE key_name = ?2", params![new_name, old_name])?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn delete_key(&self, name: &str) -> SignerResult<()> {
        let name = name.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute("DELETE FROM keys WHERE name = ?1", params![name])?;
            Ok(())
        })
    }

    async fn upsert_app(&self, app: &App) -> SignerResult<()> {
        let app = app.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO apps (key_name, remote_pubkey, description, trust_level, custom_relays, suspended_at, suspend_until, revoked_at, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(key_name, remote_pubkey) DO UPDATE SET
                   description=excluded.description, trust_level=excluded.trust_level, custom_relays=excluded.custom_relays,
                   suspended_at=excluded.suspended_at, suspend_until=excluded.suspend_until, revoked_at=excluded.revoked_at,
                   last_used_at=excluded.last_used_at",
                params![
                    app.key_name, app.remote_pubkey, app.description, app.trust_level.as_str(),
                    Self::relays_to_json(&app.custom_relays), app.suspended_at, app.suspend_until,
                    app.revoked_at, app.created_at, app.last_used_at,
                ],
            )?;
            Ok(())
        })
    }

    async fn get_app(&self, key_name: &str, remote_pubkey: &str) -> SignerResult<Option<App>> {
        let (key_name, remote_pubkey) = (key_name.to_string(), remote_pubkey.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<App>> {
            Ok(conn
                .query_row(
                    "SELECT * FROM apps WHERE key_name = ?1 AND remote_pubkey = ?2",
                    params![key_name, remote_pubkey],
                    Self::row_to_app,
                )
                .optional()?)
        })
    }

    async fn list_apps(&self, key_name: &str) -> SignerResult<Vec<App>> {
        let key_name = key_name.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Vec<App>> {
            let mut stmt = conn.prepare("SELECT * FROM apps WHERE key_name = ?1")?;
            let rows = stmt.query_map(params![key_name], Self::row_to_app)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    async fn touch_app_last_used(&self, key_name: &str, remote_pubkey: &str, at: i64) -> SignerResult<()> {
        let (key_name, remote_pubkey) = (key_name.to_string(), remote_pubkey.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "UPDATE apps SET last_used_at = ?1 WHERE key_name = ?2 AND remote_pubkey = ?3",
                params![at, key_name, remote_pubkey],
            )?;
            Ok(())
        })
    }

    async fn suspend_app(&self, key_name: &str, remote_pubkey: &str, at: i64, until: Option<i64>) -> SignerResult<()> {
        let (key_name, remote_pubkey) = (key_name.to_string(), remote_pubkey.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "UPDATE apps SET suspended_at = ?1, suspend_until = ?2 WHERE key_name = ?3 AND remote_pubkey = ?4",
                params![at, until, key_name, remote_pubkey],
            )?;
            Ok(())
        })
    }

    async fn suspend_all_apps(&self, at: i64) -> SignerResult<Vec<(String, String)>> {
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Vec<(String, String)>> {
            let mut stmt = conn.prepare(
                "SELECT key_name, remote_pubkey FROM apps WHERE revoked_at IS NULL AND suspended_at IS NULL",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let targets: Vec<(String, String)> = rows.collect::<Result<Vec<_>, _>>()?;
            conn.execute(
                "UPDATE apps SET suspended_at = ?1 WHERE revoked_at IS NULL AND suspended_at IS NULL",
                params![at],
            )?;
            Ok(targets)
        })
    }

    async fn revoke_app(&self, key_name: &str, remote_pubkey: &str, at: i64) -> SignerResult<()> {
        let (key_name, remote_pubkey) = (key_name.to_string(), remote_pubkey.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "UPDATE apps SET revoked_at = ?1 WHERE key_name = ?2 AND remote_pubkey = ?3",
                params![at, key_name, remote_pubkey],
            )?;
            Ok(())
        })
    }

    async fn revoke_apps_for_key(&self, key_name: &str, at: i64) -> SignerResult<()> {
        let key_name = key_name.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "UPDATE apps SET revoked_at = ?1 WHERE key_name = ?2 AND revoked_at IS NULL",
                params![at, key_name],
            )?;
            Ok(())
        })
    }

    async fn upsert_permission(&self, perm: &SavedPermission) -> SignerResult<()> {
        let perm = perm.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO saved_permissions (key_name, remote_pubkey, method, kind, allowed) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key_name, remote_pubkey, method, kind) DO UPDATE SET allowed=excluded.allowed",
                params![perm.key_name, perm.remote_pubkey, perm.method, perm.kind.map(|k| k as i64), perm.allowed],
            )?;
            Ok(())
        })
    }

    async fn find_permission(
        &self,
        key_name: &str,
        remote_pubkey: &str,
        method: &str,
        kind: Option<u64>,
    ) -> SignerResult<Option<SavedPermission>> {
        let (key_name, remote_pubkey, method) = (key_name.to_string(), remote_pubkey.to_string(), method.to_string());
        let kind_i64 = kind.map(|k| k as i64);
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<SavedPermission>> {
            Ok(conn
                .query_row(
                    "SELECT key_name, remote_pubkey, method, kind, allowed FROM saved_permissions
                     WHERE key_name = ?1 AND remote_pubkey = ?2 AND method = ?3 AND kind IS ?4",
                    params![key_name, remote_pubkey, method, kind_i64],
                    |row| {
                        Ok(SavedPermission {
                            key_name: row.get(0)?,
                            remote_pubkey: row.get(1)?,
                            method: row.get(2)?,
                            kind: row.get::<_, Option<i64>>(3)?.map(|k| k as u64),
                            allowed: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn insert_pending_request(&self, req: &PendingRequest) -> SignerResult<()> {
        let req = req.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO pending_requests (request_id, key_name, remote_pubkey, method, params_json, created_at, decision, decided_at, approval_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL)",
                params![req.request_id, req.key_name, req.remote_pubkey, req.method, req.params_json, req.created_at],
            )?;
            Ok(())
        })
    }

    async fn get_pending_request(&self, request_id: &str) -> SignerResult<Option<PendingRequest>> {
        let request_id = request_id.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<PendingRequest>> {
            Ok(conn
                .query_row(
                    "SELECT * FROM pending_requests WHERE request_id = ?1",
                    params![request_id],
                    Self::row_to_pending,
                )
                .optional()?)
        })
    }

    async fn decide_pending_request(&self, request_id: &str, approved: bool, at: i64) -> SignerResult<()> {
        let request_id = request_id.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "UPDATE pending_requests SET decision = ?1, decided_at = ?2, approval_type = 'manual'
                 WHERE request_id = ?3 AND decision IS NULL",
                params![approved as i64, at, request_id],
            )?;
            Ok(())
        })
    }

    async fn create_token(&self, token: &ConnectionToken) -> SignerResult<()> {
        let token = token.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO connection_tokens (token, key_name, issued_at, expires_at, redeemed_at, policy_template)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
                params![token.token, token.key_name, token.issued_at, token.expires_at, token.policy_template],
            )?;
            Ok(())
        })
    }

    async fn get_token(&self, token: &str) -> SignerResult<Option<ConnectionToken>> {
        let token = token.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<ConnectionToken>> {
            Ok(conn
                .query_row("SELECT * FROM connection_tokens WHERE token = ?1", params![token], Self::row_to_token)
                .optional()?)
        })
    }

    async fn claim_token(&self, token: &str, at: i64) -> SignerResult<bool> {
        let token = token.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<bool> {
            // CAS: the UPDATE only touches a row that is still unredeemed and
            // unexpired, so concurrent callers racing on the same token id
            // can only have one affect a row (spec §8 "Token linearity").
            let affected = conn.execute(
                "UPDATE connection_tokens SET redeemed_at = ?1 WHERE token = ?2 AND redeemed_at IS NULL AND expires_at > ?1",
                params![at, token],
            )?;
            Ok(affected == 1)
        })
    }

    async fn append_audit(&self, record: &AuditRecordInput) -> SignerResult<()> {
        let (key_name, kind, detail) = (record.key_name.clone(), record.kind.clone(), record.detail.clone());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO audit_log (key_name, kind, detail, at) VALUES (?1, ?2, ?3, strftime('%s','now'))",
                params![key_name, kind, detail],
            )?;
            Ok(())
        })
    }

    async fn list_audit(&self, key_name: Option<&str>, since: Option<i64>, limit: usize) -> SignerResult<Vec<AuditRecord>> {
        let key_name = key_name.map(|s| s.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Vec<AuditRecord>> {
            let mut stmt = conn.prepare(
                "SELECT id, key_name, kind, detail, at FROM audit_log
                 WHERE (?1 IS NULL OR key_name = ?1) AND (?2 IS NULL OR at >= ?2)
                 ORDER BY at DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![key_name, since, limit as i64], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    key_name: row.get(1)?,
                    kind: row.get(2)?,
                    detail: row.get(3)?,
                    at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    async fn get_deadman_state(&self) -> SignerResult<DeadManSwitchState> {
        blocking!(self.conn, |conn: &Connection| -> SignerResult<DeadManSwitchState> {
            let row = conn
                .query_row(
                    "SELECT enabled, timeframe_sec, last_reset_at, panic_triggered_at, warnings_sent FROM deadman_state WHERE id = 0",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)? != 0,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                None => Ok(DeadManSwitchState::default()),
                Some((enabled, timeframe_sec, last_reset_at, panic_triggered_at, warnings_json)) => Ok(DeadManSwitchState {
                    enabled,
                    timeframe_sec,
                    last_reset_at,
                    panic_triggered_at,
                    warnings_sent: serde_json::from_str(&warnings_json).unwrap_or_default(),
                }),
            }
        })
    }

    async fn put_deadman_state(&self, state: &DeadManSwitchState) -> SignerResult<()> {
        let state = state.clone();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            let warnings_json = serde_json::to_string(&state.warnings_sent)?;
            conn.execute(
                "INSERT INTO deadman_state (id, enabled, timeframe_sec, last_reset_at, panic_triggered_at, warnings_sent)
                 VALUES (0, ?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET enabled=excluded.enabled, timeframe_sec=excluded.timeframe_sec,
                   last_reset_at=excluded.last_reset_at, panic_triggered_at=excluded.panic_triggered_at, warnings_sent=excluded.warnings_sent",
                params![state.enabled as i64, state.timeframe_sec, state.last_reset_at, state.panic_triggered_at, warnings_json],
            )?;
            Ok(())
        })
    }

    async fn get_setting(&self, key: &str) -> SignerResult<Option<String>> {
        let key = key.to_string();
        blocking!(self.conn, |conn: &Connection| -> SignerResult<Option<String>> {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
                .optional()?)
        })
    }

    async fn set_setting(&self, key: &str, value: &str) -> SignerResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        blocking!(self.conn, |conn: &Connection| -> SignerResult<()> {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(key_name: &str, remote: &str) -> App {
        App {
            key_name: key_name.to_string(),
            remote_pubkey: remote.to_string(),
            description: None,
            trust_level: TrustLevel::Reasonable,
            custom_relays: vec![],
            suspended_at: None,
            suspend_until: None,
            revoked_at: None,
            created_at: 1000,
            last_used_at: 1000,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_app_round_trip() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.upsert_app(&sample_app("alice", "pubkey1")).await.unwrap();
        let got = repo.get_app("alice", "pubkey1").await.unwrap().unwrap();
        assert_eq!(got.trust_level, TrustLevel::Reasonable);
    }

    #[tokio::test]
    async fn token_claim_is_linearized() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.create_token(&ConnectionToken {
            token: "T".into(),
            key_name: "alice".into(),
            issued_at: 0,
            expires_at: 1_000_000,
            redeemed_at: None,
            policy_template: None,
        })
        .await
        .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.claim_token("T", 10 + i).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn suspend_all_apps_returns_targets_and_skips_revoked() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.upsert_app(&sample_app("alice", "p1")).await.unwrap();
        let mut revoked = sample_app("alice", "p2");
        revoked.revoked_at = Some(5);
        repo.upsert_app(&revoked).await.unwrap();

        let targets = repo.suspend_all_apps(100).await.unwrap();
        assert_eq!(targets, vec![("alice".to_string(), "p1".to_string())]);

        let app1 = repo.get_app("alice", "p1").await.unwrap().unwrap();
        assert_eq!(app1.suspended_at, Some(100));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert!(repo.get_setting("dashboard_url").await.unwrap().is_none());
        repo.set_setting("dashboard_url", "https://example.test").await.unwrap();
        assert_eq!(repo.get_setting("dashboard_url").await.unwrap().unwrap(), "https://example.test");
    }
}
