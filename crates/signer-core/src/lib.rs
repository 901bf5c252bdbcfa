//! Core library for the signing daemon: key vault, persistent store, relay
//! transport, authorization engine, RPC backend, request authorization
//! loop, inactivity lock, and the event bus tying them together (spec
//! §2 data flow).

pub mod authloop;
pub mod authz;
pub mod bus;
pub mod config;
pub mod context;
pub mod crypto;
pub mod deadman;
pub mod error;
pub mod relay;
pub mod rpc;
pub mod store;
pub mod uri;
pub mod validation;
pub mod vault;

use std::collections::HashMap;
use std::sync::Arc;

use nostr_sdk::Keys;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument};

use crate::authloop::AuthorizationLoop;
use crate::authz::AuthorizationEngine;
use crate::config::Config;
use crate::context::SignerContext;
use crate::deadman::InactivityLock;
use crate::error::{SignerError, SignerResult};
use crate::relay::{RelayPool, SubscriptionManager};
use crate::rpc::RpcBackend;
use crate::store::{KeyBody, Repository};
use crate::vault::Vault;

fn now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64
}

/// How a key's secret material originates for `Daemon::create_key` (spec
/// §4.1 `create(name, source, encryption)`).
pub enum KeySource {
    Generate,
    ImportPlain(nostr_sdk::SecretKey),
    ImportWrapped(String),
}

/// Target at-rest encoding for `Daemon::create_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncryption {
    None,
    Legacy,
    Nip49,
}

/// Export form for `Daemon::export_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Nsec,
    Ncryptsec,
}

/// One active key's full runtime: its RPC backend plus every subscription id
/// it owns — the key-wide one plus one per connected app with custom
/// relays — so the daemon can unsubscribe all of them and drop the backend
/// on lock.
struct RunningKey {
    backend: Arc<RpcBackend>,
    subscription_ids: Vec<String>,
}

/// Top-level orchestration: wires the vault, store, relay transport,
/// authorization engine, and inactivity lock together and starts/stops a
/// per-key `RpcBackend` as keys unlock/lock (spec §2, §4.4).
///
/// This is the seam a binary crate (`signerd`) drives; it owns nothing the
/// individual components don't already own, it just sequences startup.
pub struct Daemon {
    pub ctx: SignerContext,
    pool: Arc<RelayPool>,
    subs: Arc<SubscriptionManager>,
    authz: Arc<AuthorizationEngine>,
    auth_loop: Arc<AuthorizationLoop>,
    deadman: Arc<InactivityLock>,
    dashboard_base_url: Option<String>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: Mutex<HashMap<String, RunningKey>>,
}

impl Daemon {
    /// Load configuration, open the store, and bring up the relay pool.
    /// Does not unlock any keys — callers unlock via `activate_key` once a
    /// passphrase is available (interactively or from a wrapped startup
    /// secret).
    #[instrument(skip(config, repo))]
    pub async fn bootstrap(config: Config, repo: Arc<dyn Repository>) -> SignerResult<Self> {
        let ctx = SignerContext::new(config, repo);
        let relays = ctx.config.relays_or_default();

        // The pool needs *a* keypair to open sockets under nostr-sdk's
        // `Client`; an ephemeral one is fine since it never signs
        // anything itself — every outbound event is signed by the
        // per-active-key `Keys` at publish time via `RelayPool::publish`.
        let transport_identity = Keys::generate();
        let pool = Arc::new(RelayPool::connect(transport_identity, relays).await?);
        let subs = Arc::new(SubscriptionManager::new(pool.clone()));

        let authz = Arc::new(AuthorizationEngine::new(
            ctx.repo.clone(),
            ctx.bus.clone(),
            ctx.decision_cache.clone(),
        ));
        let auth_loop = Arc::new(AuthorizationLoop::new(ctx.repo.clone(), ctx.bus.clone()));
        let deadman = Arc::new(InactivityLock::new(ctx.repo.clone(), ctx.vault.clone(), ctx.bus.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dashboard_base_url = ctx.config.base_url.clone();

        for record in ctx.repo.list_keys().await? {
            let public_key = nostr_sdk::PublicKey::from_hex(&record.public_key_hex)
                .map_err(|e| SignerError::InvalidKeyForm(e.to_string()))?;
            match &record.body {
                KeyBody::Plaintext { secret_hex } => {
                    let secret = nostr_sdk::SecretKey::from_hex(secret_hex)
                        .map_err(|e| SignerError::InvalidKeyForm(e.to_string()))?;
                    ctx.vault.import_plaintext(&record.name, &secret).await?;
                }
                body => {
                    // Legacy/NIP-49 wrapped keys stay locked until an operator
                    // supplies the passphrase (`signerd`'s startup prompt).
                    ctx.vault.register_locked(&record.name, public_key, body).await?;
                }
            }
        }

        Ok(Self {
            ctx,
            pool,
            subs,
            authz,
            auth_loop,
            deadman,
            dashboard_base_url,
            shutdown_tx,
            shutdown_rx,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Unlock an encrypted key with its passphrase and bring its RPC
    /// backend up. The operator-facing counterpart of `activate_key` for
    /// keys that weren't loaded plaintext at boot.
    pub async fn unlock_key(&self, key_name: &str, passphrase: &str) -> SignerResult<()> {
        self.ctx.vault.unlock(key_name, passphrase).await?;
        self.activate_key(key_name).await
    }

    /// Names of every registered key currently locked — what a startup
    /// prompt should offer to unlock.
    pub async fn locked_key_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in self.ctx.vault.list_names().await {
            if matches!(self.ctx.vault.lock_state(&name).await, Ok(vault::LockState::Locked)) {
                out.push(name);
            }
        }
        out
    }

    /// Start (or restart) the RPC backend for every currently-unlocked key
    /// that isn't already running (e.g. the plaintext keys loaded active at
    /// boot, or a key an operator just unlocked).
    pub async fn activate_all_unlocked(&self) -> SignerResult<()> {
        for name in self.ctx.vault.list_names().await {
            if matches!(self.ctx.vault.lock_state(&name).await, Ok(vault::LockState::Unlocked))
                && !self.running.lock().await.contains_key(&name)
            {
                self.activate_key(&name).await?;
            }
        }
        Ok(())
    }

    /// Start (or restart) the RPC backend for a key that just became
    /// unlocked: subscribe to `kind=24133` tagged to its pubkey on the
    /// configured relay set, hand matching events to a fresh `RpcBackend`,
    /// and additionally open a per-app subscription on each connected app's
    /// own custom relays (spec §4.4 — an app publishing only on its own
    /// relays must still be heard).
    #[instrument(skip(self))]
    pub async fn activate_key(&self, key_name: &str) -> SignerResult<()> {
        let keys = self.ctx.vault.active_keys(key_name).await?;
        let backend = Arc::new(RpcBackend::new(
            key_name.to_string(),
            self.ctx.repo.clone(),
            self.ctx.vault.clone(),
            self.pool.clone(),
            self.authz.clone(),
            self.auth_loop.clone(),
            self.ctx.bus.clone(),
            self.dashboard_base_url.clone(),
            self.shutdown_rx.clone(),
        ));

        let filter = nostr_sdk::Filter::new()
            .kind(nostr_sdk::Kind::Custom(rpc::NIP46_KIND as u16))
            .pubkey(keys.public_key());
        let subscription_id = format!("nip46:{key_name}");
        self.subs.subscribe(&subscription_id, filter, Vec::new()).await?;
        let mut subscription_ids = vec![subscription_id];

        for app in self.ctx.repo.list_apps(key_name).await? {
            if app.revoked_at.is_some() || app.custom_relays.is_empty() {
                continue;
            }
            let app_filter = nostr_sdk::Filter::new()
                .kind(nostr_sdk::Kind::Custom(rpc::NIP46_KIND as u16))
                .pubkey(keys.public_key());
            let app_subscription_id = format!("nip46:{key_name}:app:{}", app.remote_pubkey);
            self.subs.subscribe(&app_subscription_id, app_filter, app.custom_relays).await?;
            subscription_ids.push(app_subscription_id);
        }

        self.running.lock().await.insert(key_name.to_string(), RunningKey { backend, subscription_ids });
        self.ctx.bus.publish(crate::bus::DomainEvent::KeyUnlocked { key_name: key_name.to_string() });
        Ok(())
    }

    /// Create a new key (spec §4.1 `create`). `source` selects how the
    /// secret material originates; `encryption` selects its at-rest form.
    /// Passphrase is required iff `encryption` is not `None` — callers pass
    /// an empty string for plaintext creation. New keys persist immediately
    /// and, if stored encrypted, start locked (an operator unlocks them
    /// explicitly, matching how boot-time keys behave).
    #[instrument(skip(self, source, passphrase))]
    pub async fn create_key(
        &self,
        name: &str,
        source: KeySource,
        encryption: KeyEncryption,
        passphrase: &str,
    ) -> SignerResult<nostr_sdk::PublicKey> {
        if matches!(encryption, KeyEncryption::None) && !passphrase.is_empty() {
            return Err(SignerError::InvalidInput(
                "encryption=none does not accept a passphrase".into(),
            ));
        }

        let public_key = match (&source, &encryption) {
            (KeySource::Generate, KeyEncryption::None) => {
                let keys = Keys::generate();
                let secret = keys.secret_key().clone();
                self.ctx.vault.import_plaintext(name, &secret).await?
            }
            (KeySource::Generate, _) => self.ctx.vault.generate(name, passphrase).await?,
            (KeySource::ImportPlain(secret), KeyEncryption::None) => {
                self.ctx.vault.import_plaintext(name, secret).await?
            }
            (KeySource::ImportPlain(secret), _) => self.ctx.vault.import(name, secret, passphrase).await?,
            (KeySource::ImportWrapped(ncryptsec), _) => {
                self.ctx.vault.import_wrapped_nip49(name, ncryptsec, passphrase).await?
            }
        };

        // A generated key's at-rest form may need one more wrap: `generate`
        // and `import` always legacy-wrap, so a caller asking for NIP-49
        // gets a post-hoc rewrap under the same passphrase.
        if matches!(encryption, KeyEncryption::Nip49)
            && !matches!(source, KeySource::ImportWrapped(_))
        {
            self.ctx.vault.rewrap(name, passphrase, vault::EncryptionFormat::Nip49).await?;
        }

        self.persist_key(name, public_key, None).await?;

        // Best-effort skeleton identity event; failure is non-fatal (spec
        // §4.1 "Generates a skeleton identity event on the relays for new
        // keys").
        if let Ok(keys) = self.ctx.vault.active_keys(name).await {
            let event = nostr_sdk::EventBuilder::new(nostr_sdk::Kind::Metadata, "{}")
                .build(keys.public_key())
                .sign(&keys)
                .await;
            if let Ok(event) = event {
                let _ = self.pool.publish(event, &[]).await;
            }
        }

        self.ctx.bus.publish(crate::bus::DomainEvent::KeyCreated { key_name: name.to_string() });
        Ok(public_key)
    }

    /// Lock an unlocked key and stop its RPC backend (spec §4.1 `lock`).
    pub async fn lock_key(&self, name: &str) -> SignerResult<()> {
        self.ctx.vault.lock(name).await?;
        self.deactivate_key(name).await;
        Ok(())
    }

    /// Rename a key across the vault, the repository row, and (if present)
    /// its running backend's subscription (spec §4.1 `rename` — atomic
    /// across all three).
    #[instrument(skip(self))]
    pub async fn rename_key(&self, old_name: &str, new_name: &str) -> SignerResult<()> {
        let was_running = self.running.lock().await.contains_key(old_name);
        if was_running {
            self.deactivate_key(old_name).await;
        }
        self.ctx.vault.rename(old_name, new_name).await?;
        self.ctx.repo.rename_key(old_name, new_name).await?;
        if was_running {
            self.activate_key(new_name).await?;
        }
        Ok(())
    }

    /// Delete a key: cascading-revoke every app authorized against it, drop
    /// its repository row, stop its backend, and remove it from the vault
    /// (spec §4.1 `delete` — passphrase required iff encrypted and locked).
    #[instrument(skip(self, passphrase))]
    pub async fn delete_key(&self, name: &str, passphrase: Option<&str>) -> SignerResult<()> {
        if matches!(self.ctx.vault.lock_state(name).await?, vault::LockState::Locked) {
            let passphrase = passphrase.ok_or_else(|| SignerError::KeyLocked(name.to_string()))?;
            self.ctx.vault.verify_passphrase(name, passphrase).await?;
        }
        self.deactivate_key(name).await;
        self.ctx.repo.revoke_apps_for_key(name, now()).await?;
        self.ctx.repo.delete_key(name).await?;
        self.ctx.vault.remove(name).await?;
        self.ctx.bus.publish(crate::bus::DomainEvent::KeyDeleted { key_name: name.to_string() });
        Ok(())
    }

    /// Wrap a currently-plaintext key under `passphrase` in `format` (spec
    /// §4.1 `encrypt`).
    pub async fn encrypt_key(&self, name: &str, passphrase: &str, format: vault::EncryptionFormat) -> SignerResult<()> {
        if self.ctx.vault.encryption_format(name).await?.is_some() {
            return Err(SignerError::AlreadyEncrypted(name.to_string()));
        }
        self.ctx.vault.rewrap(name, passphrase, format).await?;
        self.persist_key(name, self.ctx.vault.public_key(name).await?, None).await
    }

    /// Convert a legacy-wrapped key to NIP-49, verifying `passphrase` via
    /// legacy decrypt first if the key is currently locked (spec §4.1
    /// `migrate`).
    #[instrument(skip(self, passphrase))]
    pub async fn migrate_key(&self, name: &str, passphrase: &str) -> SignerResult<()> {
        let was_locked = matches!(self.ctx.vault.lock_state(name).await?, vault::LockState::Locked);
        if was_locked {
            self.ctx.vault.unlock(name, passphrase).await?;
        } else {
            self.ctx.vault.verify_passphrase(name, passphrase).await?;
        }
        self.ctx.vault.rewrap(name, passphrase, vault::EncryptionFormat::Nip49).await?;
        self.persist_key(name, self.ctx.vault.public_key(name).await?, None).await?;
        if was_locked {
            self.ctx.vault.lock(name).await?;
        }
        Ok(())
    }

    /// Export a key's secret material (spec §4.1 `export`). `format`
    /// selects bech32 `nsec` or a re-wrapped `ncryptsec`; the latter
    /// requires `export_passphrase`.
    pub async fn export_key(
        &self,
        name: &str,
        format: ExportFormat,
        export_passphrase: Option<&str>,
    ) -> SignerResult<String> {
        match format {
            ExportFormat::Nsec => self.ctx.vault.export_nsec(name).await,
            ExportFormat::Ncryptsec => {
                let passphrase = export_passphrase
                    .ok_or_else(|| SignerError::Internal("ncryptsec export requires a passphrase".into()))?;
                self.ctx.vault.export_ncryptsec(name, passphrase).await
            }
        }
    }

    async fn persist_key(
        &self,
        name: &str,
        public_key: nostr_sdk::PublicKey,
        admin_secret_override: Option<String>,
    ) -> SignerResult<()> {
        let admin_secret = match admin_secret_override {
            Some(secret) => Some(secret),
            None => self.ctx.repo.get_key(name).await?.and_then(|r| r.admin_secret),
        };
        let body = self.ctx.vault.body_for_persistence(name).await?;
        self.ctx
            .repo
            .upsert_key(&store::KeyRecord {
                name: name.to_string(),
                public_key_hex: public_key.to_hex(),
                body,
                admin_secret,
            })
            .await
    }

    /// Stop the RPC backend for a key that was just locked.
    #[instrument(skip(self))]
    pub async fn deactivate_key(&self, key_name: &str) {
        if let Some(running) = self.running.lock().await.remove(key_name) {
            for id in &running.subscription_ids {
                self.subs.unsubscribe(id).await;
            }
        }
        self.ctx.bus.publish(crate::bus::DomainEvent::KeyLocked { key_name: key_name.to_string() });
    }

    /// Dispatch one inbound event to the right key's backend, if any.
    /// Called from the relay pool's notification loop.
    pub async fn route_event(&self, key_name: &str, event: nostr_sdk::Event) {
        let backend = self.running.lock().await.get(key_name).map(|r| r.backend.clone());
        if let Some(backend) = backend {
            backend.handle_event(event).await;
        }
    }

    pub fn relay_pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subs
    }

    pub fn inactivity_lock(&self) -> &Arc<InactivityLock> {
        &self.deadman
    }

    /// Signal every pending-request poll loop, health-check timer, and
    /// subscription to stop, then lock every active key (spec §5
    /// cancellation semantics).
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("daemon shutting down");
        let _ = self.shutdown_tx.send(true);
        self.ctx.vault.lock_all().await;
        let mut running = self.running.lock().await;
        for (name, key) in running.drain() {
            for id in &key.subscription_ids {
                self.subs.unsubscribe(id).await;
            }
            let _ = name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteRepository;

    #[tokio::test]
    async fn bootstrap_with_no_configured_keys_starts_clean() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        assert!(daemon.ctx.vault.list_names().await.is_empty());
    }

    #[tokio::test]
    async fn activate_then_deactivate_key_round_trips() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.ctx.vault.generate("alice", "pw").await.unwrap();

        daemon.activate_key("alice").await.unwrap();
        assert!(daemon.running.lock().await.contains_key("alice"));

        daemon.deactivate_key("alice").await;
        assert!(!daemon.running.lock().await.contains_key("alice"));
    }

    #[tokio::test]
    async fn shutdown_locks_every_active_key() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.ctx.vault.generate("alice", "pw").await.unwrap();
        daemon.activate_key("alice").await.unwrap();

        daemon.shutdown().await;
        assert!(daemon.ctx.vault.active_keys("alice").await.is_err());
    }

    #[tokio::test]
    async fn create_key_plaintext_persists_and_activates_on_request() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();

        daemon.create_key("pat", KeySource::Generate, KeyEncryption::None, "").await.unwrap();
        assert_eq!(daemon.ctx.vault.lock_state("pat").await.unwrap(), vault::LockState::Unlocked);

        let record = daemon.ctx.repo.get_key("pat").await.unwrap().unwrap();
        assert!(!record.is_encrypted());
    }

    #[tokio::test]
    async fn create_key_nip49_persists_wrapped_and_locked_on_restart() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo.clone()).await.unwrap();

        daemon.create_key("quinn", KeySource::Generate, KeyEncryption::Nip49, "pw").await.unwrap();
        let record = daemon.ctx.repo.get_key("quinn").await.unwrap().unwrap();
        assert!(matches!(record.body, KeyBody::Nip49Wrapped { .. }));

        let restarted = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        assert_eq!(restarted.ctx.vault.lock_state("quinn").await.unwrap(), vault::LockState::Locked);
    }

    #[tokio::test]
    async fn rename_key_preserves_identity_and_repo_row() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        let pk = daemon.create_key("rey", KeySource::Generate, KeyEncryption::None, "").await.unwrap();
        daemon.activate_key("rey").await.unwrap();

        daemon.rename_key("rey", "rey2").await.unwrap();
        assert_eq!(daemon.ctx.vault.public_key("rey2").await.unwrap(), pk);
        assert!(daemon.ctx.repo.get_key("rey").await.unwrap().is_none());
        assert!(daemon.ctx.repo.get_key("rey2").await.unwrap().is_some());
        assert!(daemon.running.lock().await.contains_key("rey2"));
    }

    #[tokio::test]
    async fn delete_key_cascades_and_removes_row() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.create_key("sam", KeySource::Generate, KeyEncryption::None, "").await.unwrap();
        daemon.activate_key("sam").await.unwrap();

        daemon.delete_key("sam", None).await.unwrap();
        assert!(daemon.ctx.repo.get_key("sam").await.unwrap().is_none());
        assert!(daemon.ctx.vault.public_key("sam").await.is_err());
        assert!(!daemon.running.lock().await.contains_key("sam"));
    }

    #[tokio::test]
    async fn delete_locked_key_requires_passphrase() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.create_key("tara", KeySource::Generate, KeyEncryption::Legacy, "pw").await.unwrap();
        daemon.lock_key("tara").await.unwrap();

        assert!(daemon.delete_key("tara", None).await.is_err());
        daemon.delete_key("tara", Some("pw")).await.unwrap();
        assert!(daemon.ctx.repo.get_key("tara").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrate_key_converts_legacy_to_nip49_and_restores_lock_state() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.create_key("uma", KeySource::Generate, KeyEncryption::Legacy, "pw").await.unwrap();
        daemon.lock_key("uma").await.unwrap();

        daemon.migrate_key("uma", "pw").await.unwrap();
        assert_eq!(daemon.ctx.vault.lock_state("uma").await.unwrap(), vault::LockState::Locked);

        let record = daemon.ctx.repo.get_key("uma").await.unwrap().unwrap();
        assert!(matches!(record.body, KeyBody::Nip49Wrapped { .. }));
    }

    #[tokio::test]
    async fn export_key_nsec_and_ncryptsec() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.create_key("vik", KeySource::Generate, KeyEncryption::None, "").await.unwrap();

        let nsec = daemon.export_key("vik", ExportFormat::Nsec, None).await.unwrap();
        assert!(nsec.starts_with("nsec1"));

        let wrapped = daemon.export_key("vik", ExportFormat::Ncryptsec, Some("exp-pw")).await.unwrap();
        assert!(wrapped.starts_with("ncryptsec1"));

        assert!(daemon.export_key("vik", ExportFormat::Ncryptsec, None).await.is_err());
    }

    #[tokio::test]
    async fn create_key_rejects_passphrase_with_no_encryption() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();

        let err = daemon
            .create_key("wes", KeySource::Generate, KeyEncryption::None, "hunter2")
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::InvalidInput(_)));
        assert!(daemon.ctx.repo.get_key("wes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activate_key_opens_a_subscription_per_app_custom_relay_set() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let daemon = Daemon::bootstrap(Config::default(), repo).await.unwrap();
        daemon.ctx.vault.generate("xia", "pw").await.unwrap();

        daemon
            .ctx
            .repo
            .upsert_app(&store::App {
                key_name: "xia".into(),
                remote_pubkey: "pk-scoped".into(),
                description: None,
                trust_level: store::TrustLevel::Full,
                custom_relays: vec!["wss://relay.example".into()],
                suspended_at: None,
                suspend_until: None,
                created_at: now(),
                last_used_at: now(),
                revoked_at: None,
            })
            .await
            .unwrap();
        daemon
            .ctx
            .repo
            .upsert_app(&store::App {
                key_name: "xia".into(),
                remote_pubkey: "pk-default".into(),
                description: None,
                trust_level: store::TrustLevel::Full,
                custom_relays: vec![],
                suspended_at: None,
                suspend_until: None,
                created_at: now(),
                last_used_at: now(),
                revoked_at: None,
            })
            .await
            .unwrap();

        daemon.activate_key("xia").await.unwrap();

        let running = daemon.running.lock().await;
        let key = running.get("xia").unwrap();
        // Key-wide subscription plus one for the app with custom relays;
        // the app with no custom relays rides the key-wide one.
        assert_eq!(key.subscription_ids.len(), 2);
        assert!(key.subscription_ids.iter().any(|id| id.contains("pk-scoped")));
    }
}
