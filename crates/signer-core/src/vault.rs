//! Key vault: at-rest storage and in-memory state of managed identities.
//!
//! A `VaultEntry` tracks one managed key by name. Its secret bytes are only
//! ever held decrypted inside an `ActiveKey` guarded by the vault's lock
//! state; nothing outside this module touches raw key material. At-rest
//! encoding is one of three forms (spec §2 `create(source, encryption)`):
//! bare plaintext (never locked), legacy AES-256-GCM/CBC, or NIP-49
//! (`ncryptsec1…`). A key's at-rest form is independent of how it was
//! imported — a NIP-49-sourced key can be re-wrapped as legacy and back via
//! `migrate`.

use std::collections::HashMap;
use std::sync::Arc;

use nostr_sdk::{Keys, PublicKey, SecretKey};
use tokio::sync::RwLock;
use zeroize::Zeroize;

use crate::crypto;
use crate::error::{SignerError, SignerResult};
use crate::store::KeyBody;
use crate::validation;

/// At-rest encoding of a managed key. `Plaintext` carries no ciphertext at
/// all — those keys are loaded active at startup and can never be locked.
#[derive(Debug, Clone)]
enum AtRest {
    Plaintext,
    Legacy(Vec<u8>),
    Nip49(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionFormat {
    Legacy,
    Nip49,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

/// One managed identity: at-rest encoding plus unlocked state, if any.
struct VaultEntry {
    public_key: PublicKey,
    at_rest: AtRest,
    active: Option<Keys>,
}

impl VaultEntry {
    fn lock_state(&self) -> LockState {
        if self.active.is_some() {
            LockState::Unlocked
        } else {
            LockState::Locked
        }
    }
}

/// In-memory registry of all managed keys, keyed by name.
///
/// The vault itself does not persist anything — `store::Repository` owns
/// the sqlite-backed `body` column; `Vault::register_locked` and
/// `Vault::body_for_persistence` are the seam between the two.
#[derive(Default)]
pub struct Vault {
    entries: RwLock<HashMap<String, VaultEntry>>,
}

impl Vault {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn insert_new(
        entries: &mut HashMap<String, VaultEntry>,
        name: &str,
        public_key: PublicKey,
        at_rest: AtRest,
        keys: Keys,
    ) -> SignerResult<()> {
        if entries.contains_key(name) {
            return Err(SignerError::AlreadyExists(name.to_string()));
        }
        entries.insert(name.to_string(), VaultEntry { public_key, at_rest, active: Some(keys) });
        Ok(())
    }

    /// Generate a new key and store it encrypted under `passphrase` (legacy
    /// at-rest form, matching spec §2's default `create(generate, legacy)`).
    pub async fn generate(&self, name: &str, passphrase: &str) -> SignerResult<PublicKey> {
        validation::validate_key_name(name)?;
        validation::validate_passphrase_len(passphrase)?;

        let keys = Keys::generate();
        let public_key = keys.public_key();
        let mut secret_bytes = keys.secret_key().to_secret_bytes();
        let ciphertext = crypto::legacy_encrypt_v2(&secret_bytes, passphrase)?;
        secret_bytes.zeroize();

        let mut entries = self.entries.write().await;
        Self::insert_new(&mut entries, name, public_key, AtRest::Legacy(ciphertext), keys)?;
        Ok(public_key)
    }

    /// Import an externally-held key (nsec/hex) and store it encrypted
    /// under `passphrase` (legacy at-rest form).
    pub async fn import(&self, name: &str, secret: &SecretKey, passphrase: &str) -> SignerResult<PublicKey> {
        validation::validate_key_name(name)?;
        validation::validate_passphrase_len(passphrase)?;

        let keys = Keys::new(secret.clone());
        let public_key = keys.public_key();
        let mut secret_bytes = secret.to_secret_bytes();
        let ciphertext = crypto::legacy_encrypt_v2(&secret_bytes, passphrase)?;
        secret_bytes.zeroize();

        let mut entries = self.entries.write().await;
        Self::insert_new(&mut entries, name, public_key, AtRest::Legacy(ciphertext), keys)?;
        Ok(public_key)
    }

    /// Import a key with `encryption = none`: held active permanently, never
    /// lockable (spec §2 — "`InvalidInput` iff `encryption=none` and a
    /// non-empty passphrase" implies a distinct no-wrapping path).
    pub async fn import_plaintext(&self, name: &str, secret: &SecretKey) -> SignerResult<PublicKey> {
        validation::validate_key_name(name)?;
        let keys = Keys::new(secret.clone());
        let public_key = keys.public_key();
        let mut entries = self.entries.write().await;
        Self::insert_new(&mut entries, name, public_key, AtRest::Plaintext, keys)?;
        Ok(public_key)
    }

    /// Import a NIP-49-wrapped (`ncryptsec1…`) key, verifying it decrypts
    /// under `passphrase`, and keep it wrapped in that same form at rest.
    pub async fn import_wrapped_nip49(&self, name: &str, ncryptsec: &str, passphrase: &str) -> SignerResult<PublicKey> {
        validation::validate_key_name(name)?;
        let mut secret_bytes = crypto::nip49_decrypt(ncryptsec, passphrase)?;
        let secret_key =
            SecretKey::from_slice(&secret_bytes).map_err(|e| SignerError::InvalidKeyForm(e.to_string()))?;
        secret_bytes.zeroize();
        let keys = Keys::new(secret_key);
        let public_key = keys.public_key();

        let mut entries = self.entries.write().await;
        Self::insert_new(&mut entries, name, public_key, AtRest::Nip49(ncryptsec.to_string()), keys)?;
        Ok(public_key)
    }

    /// Register a key that is encrypted at rest but not yet unlocked — the
    /// startup path for rows loaded from the repository (spec: a locked key
    /// exists in the registry with no `ActiveKey` until `unlock` succeeds).
    pub async fn register_locked(&self, name: &str, public_key: PublicKey, body: &KeyBody) -> SignerResult<()> {
        let at_rest = match body {
            KeyBody::Plaintext { .. } => {
                return Err(SignerError::Internal(
                    "plaintext keys must be loaded active via import_plaintext, not register_locked".into(),
                ))
            }
            KeyBody::LegacyCiphertext { blob } => AtRest::Legacy(blob.clone()),
            KeyBody::Nip49Wrapped { ncryptsec } => AtRest::Nip49(ncryptsec.clone()),
        };
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(SignerError::AlreadyExists(name.to_string()));
        }
        entries.insert(name.to_string(), VaultEntry { public_key, at_rest, active: None });
        Ok(())
    }

    pub async fn unlock(&self, name: &str, passphrase: &str) -> SignerResult<PublicKey> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;

        if entry.active.is_some() {
            return Ok(entry.public_key);
        }

        let mut secret_bytes = match &entry.at_rest {
            AtRest::Plaintext => {
                return Err(SignerError::Internal("plaintext key was locked; this should be impossible".into()))
            }
            AtRest::Legacy(ct) => crypto::legacy_decrypt(ct, passphrase)?,
            AtRest::Nip49(enc) => crypto::nip49_decrypt(enc, passphrase)?,
        };
        let secret_key = SecretKey::from_slice(&secret_bytes).map_err(|e| SignerError::InvalidKeyForm(e.to_string()))?;
        secret_bytes.zeroize();
        let keys = Keys::new(secret_key);

        if keys.public_key() != entry.public_key {
            return Err(SignerError::Internal("decrypted key does not match stored public key".into()));
        }

        entry.active = Some(keys);
        Ok(entry.public_key)
    }

    /// Check a passphrase without mutating lock state (spec §4.1
    /// `verifyPassphrase`) — used by the inactivity lock to gate sensitive
    /// operations without re-unlocking the key.
    pub async fn verify_passphrase(&self, name: &str, passphrase: &str) -> SignerResult<()> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        let mut secret_bytes = match &entry.at_rest {
            AtRest::Plaintext => return Ok(()),
            AtRest::Legacy(ct) => crypto::legacy_decrypt(ct, passphrase)?,
            AtRest::Nip49(enc) => crypto::nip49_decrypt(enc, passphrase)?,
        };
        secret_bytes.zeroize();
        Ok(())
    }

    /// Rename a managed key's vault entry. Callers are responsible for
    /// renaming the corresponding repository row and any config reference
    /// so the three stay in lockstep (spec §4.1 `rename` — "atomic across
    /// in-memory map, repository rows, and the stored config").
    pub async fn rename(&self, old_name: &str, new_name: &str) -> SignerResult<()> {
        validation::validate_key_name(new_name)?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(new_name) {
            return Err(SignerError::AlreadyExists(new_name.to_string()));
        }
        let entry = entries.remove(old_name).ok_or_else(|| SignerError::NotFound(old_name.to_string()))?;
        entries.insert(new_name.to_string(), entry);
        Ok(())
    }

    /// Export the raw secret as bech32 `nsec1...`. Requires the key to
    /// currently be unlocked.
    pub async fn export_nsec(&self, name: &str) -> SignerResult<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        let keys = entry.active.as_ref().ok_or_else(|| SignerError::KeyLocked(name.to_string()))?;
        let mut secret_bytes = keys.secret_key().to_secret_bytes();
        let out = crypto::secret_key_to_nsec(&secret_bytes);
        secret_bytes.zeroize();
        out
    }

    /// Locks an encrypted key. Plaintext keys reject this (spec: they are
    /// "loaded into memory at startup and never locked").
    pub async fn lock(&self, name: &str) -> SignerResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        if matches!(entry.at_rest, AtRest::Plaintext) {
            return Err(SignerError::NotEncrypted(name.to_string()));
        }
        entry.active = None;
        Ok(())
    }

    /// Locks every encrypted key, silently skipping plaintext ones (used by
    /// the inactivity lock's panic path and daemon shutdown — neither wants
    /// to fail just because some keys are unwrappable by design).
    pub async fn lock_all(&self) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if !matches!(entry.at_rest, AtRest::Plaintext) {
                entry.active = None;
            }
        }
    }

    pub async fn remove(&self, name: &str) -> SignerResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(name).map(|_| ()).ok_or_else(|| SignerError::NotFound(name.to_string()))
    }

    pub async fn lock_state(&self, name: &str) -> SignerResult<LockState> {
        let entries = self.entries.read().await;
        entries.get(name).map(VaultEntry::lock_state).ok_or_else(|| SignerError::NotFound(name.to_string()))
    }

    /// Current at-rest format, or `None` for a plaintext (never-wrapped)
    /// entry — distinguishes `encrypt` (plaintext → wrapped) from `migrate`
    /// (wrapped → a different wrapped form) at the daemon layer.
    pub async fn encryption_format(&self, name: &str) -> SignerResult<Option<EncryptionFormat>> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        Ok(match entry.at_rest {
            AtRest::Plaintext => None,
            AtRest::Legacy(_) => Some(EncryptionFormat::Legacy),
            AtRest::Nip49(_) => Some(EncryptionFormat::Nip49),
        })
    }

    pub async fn public_key(&self, name: &str) -> SignerResult<PublicKey> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.public_key).ok_or_else(|| SignerError::NotFound(name.to_string()))
    }

    pub async fn list_names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }

    /// Re-wrap an unlocked key's secret under a new at-rest format (spec §2
    /// `migrate`/`encrypt`). Requires the key to currently be unlocked so
    /// the passphrase can be verified by the caller first if desired.
    pub async fn rewrap(&self, name: &str, passphrase: &str, format: EncryptionFormat) -> SignerResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        let keys = entry.active.as_ref().ok_or_else(|| SignerError::KeyLocked(name.to_string()))?;
        let mut secret_bytes = keys.secret_key().to_secret_bytes();
        entry.at_rest = match format {
            EncryptionFormat::Legacy => AtRest::Legacy(crypto::legacy_encrypt_v2(&secret_bytes, passphrase)?),
            EncryptionFormat::Nip49 => {
                AtRest::Nip49(crypto::nip49_encrypt(&secret_bytes, passphrase, crypto::NIP49_KEY_SECURITY_UNKNOWN)?)
            }
        };
        secret_bytes.zeroize();
        Ok(())
    }

    /// Export a NIP-49 `ncryptsec` representation re-wrapped under a
    /// (possibly new) passphrase. Requires the key to currently be unlocked.
    pub async fn export_ncryptsec(&self, name: &str, passphrase: &str) -> SignerResult<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        let keys = entry.active.as_ref().ok_or_else(|| SignerError::KeyLocked(name.to_string()))?;
        let mut secret_bytes = keys.secret_key().to_secret_bytes();
        let out = crypto::nip49_encrypt(&secret_bytes, passphrase, crypto::NIP49_KEY_SECURITY_UNKNOWN);
        secret_bytes.zeroize();
        out
    }

    /// Returns the live `Keys` for signing/encryption operations. Errors if
    /// the key is locked.
    pub async fn active_keys(&self, name: &str) -> SignerResult<Arc<Keys>> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        entry.active.as_ref().map(|k| Arc::new(k.clone())).ok_or_else(|| SignerError::KeyLocked(name.to_string()))
    }

    /// The `KeyBody` this entry should be persisted as. For a plaintext
    /// entry the secret is read back out of the (always-present) active
    /// `Keys`, since there is no separate ciphertext to store.
    pub async fn body_for_persistence(&self, name: &str) -> SignerResult<KeyBody> {
        let entries = self.entries.read().await;
        let entry = entries.get(name).ok_or_else(|| SignerError::NotFound(name.to_string()))?;
        Ok(match &entry.at_rest {
            AtRest::Plaintext => {
                let keys = entry.active.as_ref().ok_or_else(|| {
                    SignerError::Internal("plaintext key missing its active material".into())
                })?;
                KeyBody::Plaintext { secret_hex: keys.secret_key().display_secret().to_string() }
            }
            AtRest::Legacy(ct) => KeyBody::LegacyCiphertext { blob: ct.clone() },
            AtRest::Nip49(enc) => KeyBody::Nip49Wrapped { ncryptsec: enc.clone() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_then_unlock_round_trip() {
        let vault = Vault::new();
        let pk = vault.generate("alice", "hunter2").await.unwrap();
        assert_eq!(vault.public_key("alice").await.unwrap(), pk);
        assert_eq!(vault.lock_state("alice").await.unwrap(), LockState::Unlocked);

        vault.lock("alice").await.unwrap();
        assert_eq!(vault.lock_state("alice").await.unwrap(), LockState::Locked);
        assert!(vault.active_keys("alice").await.is_err());

        let unlocked_pk = vault.unlock("alice", "hunter2").await.unwrap();
        assert_eq!(unlocked_pk, pk);
        assert!(vault.active_keys("alice").await.is_ok());
    }

    #[tokio::test]
    async fn unlock_with_wrong_passphrase_fails() {
        let vault = Vault::new();
        vault.generate("bob", "correct").await.unwrap();
        vault.lock("bob").await.unwrap();
        assert!(matches!(vault.unlock("bob", "incorrect").await, Err(SignerError::WrongPassphrase)));
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let vault = Vault::new();
        vault.generate("carol", "pw").await.unwrap();
        assert!(matches!(vault.generate("carol", "pw2").await, Err(SignerError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn export_ncryptsec_requires_unlocked() {
        let vault = Vault::new();
        vault.generate("dana", "pw").await.unwrap();
        vault.lock("dana").await.unwrap();
        assert!(matches!(vault.export_ncryptsec("dana", "pw2").await, Err(SignerError::KeyLocked(_))));

        vault.unlock("dana", "pw").await.unwrap();
        let wrapped = vault.export_ncryptsec("dana", "pw2").await.unwrap();
        assert!(wrapped.starts_with("ncryptsec1"));
    }

    #[tokio::test]
    async fn plaintext_keys_are_always_active_and_unlockable() {
        let vault = Vault::new();
        let secret = Keys::generate().secret_key().clone();
        let pk = vault.import_plaintext("erin", &secret).await.unwrap();
        assert_eq!(vault.lock_state("erin").await.unwrap(), LockState::Unlocked);
        assert_eq!(vault.public_key("erin").await.unwrap(), pk);
        assert!(matches!(vault.lock("erin").await, Err(SignerError::NotEncrypted(_))));
    }

    #[tokio::test]
    async fn nip49_import_round_trips_and_persists_as_wrapped() {
        let vault = Vault::new();
        let secret = Keys::generate().secret_key().clone();
        let wrapped = crypto::nip49_encrypt(&secret.to_secret_bytes(), "pw", crypto::NIP49_KEY_SECURITY_UNKNOWN).unwrap();

        let pk = vault.import_wrapped_nip49("frank", &wrapped, "pw").await.unwrap();
        assert_eq!(Keys::new(secret).public_key(), pk);

        vault.lock("frank").await.unwrap();
        assert!(vault.active_keys("frank").await.is_err());
        vault.unlock("frank", "pw").await.unwrap();
        assert!(vault.active_keys("frank").await.is_ok());

        match vault.body_for_persistence("frank").await.unwrap() {
            KeyBody::Nip49Wrapped { ncryptsec } => assert_eq!(ncryptsec, wrapped),
            other => panic!("expected Nip49Wrapped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewrap_converts_at_rest_format() {
        let vault = Vault::new();
        vault.generate("grace", "pw").await.unwrap();
        vault.rewrap("grace", "newpw", EncryptionFormat::Nip49).await.unwrap();

        match vault.body_for_persistence("grace").await.unwrap() {
            KeyBody::Nip49Wrapped { .. } => {}
            other => panic!("expected Nip49Wrapped after rewrap, got {other:?}"),
        }

        vault.lock("grace").await.unwrap();
        assert!(vault.unlock("grace", "pw").await.is_err());
        assert!(vault.unlock("grace", "newpw").await.is_ok());
    }

    #[tokio::test]
    async fn verify_passphrase_does_not_mutate_lock_state() {
        let vault = Vault::new();
        vault.generate("ivy", "pw").await.unwrap();
        vault.lock("ivy").await.unwrap();

        assert!(vault.verify_passphrase("ivy", "pw").await.is_ok());
        assert!(matches!(vault.verify_passphrase("ivy", "wrong").await, Err(SignerError::WrongPassphrase)));
        assert_eq!(vault.lock_state("ivy").await.unwrap(), LockState::Locked);
    }

    #[tokio::test]
    async fn rename_moves_entry_and_rejects_collision() {
        let vault = Vault::new();
        let pk = vault.generate("jan", "pw").await.unwrap();
        vault.generate("kim", "pw").await.unwrap();

        assert!(matches!(vault.rename("jan", "kim").await, Err(SignerError::AlreadyExists(_))));
        vault.rename("jan", "jan2").await.unwrap();
        assert!(matches!(vault.public_key("jan").await, Err(SignerError::NotFound(_))));
        assert_eq!(vault.public_key("jan2").await.unwrap(), pk);
    }

    #[tokio::test]
    async fn export_nsec_requires_unlocked_and_round_trips() {
        let vault = Vault::new();
        vault.generate("liam", "pw").await.unwrap();
        vault.lock("liam").await.unwrap();
        assert!(matches!(vault.export_nsec("liam").await, Err(SignerError::KeyLocked(_))));

        vault.unlock("liam", "pw").await.unwrap();
        let nsec = vault.export_nsec("liam").await.unwrap();
        assert!(nsec.starts_with("nsec1"));
    }

    #[tokio::test]
    async fn encryption_format_distinguishes_plaintext_from_wrapped() {
        let vault = Vault::new();
        let secret = Keys::generate().secret_key().clone();
        vault.import_plaintext("mona", &secret).await.unwrap();
        vault.generate("nora", "pw").await.unwrap();

        assert_eq!(vault.encryption_format("mona").await.unwrap(), None);
        assert_eq!(vault.encryption_format("nora").await.unwrap(), Some(EncryptionFormat::Legacy));
    }

    #[tokio::test]
    async fn register_locked_then_unlock_matches_legacy_row() {
        let origin = Vault::new();
        origin.generate("henry", "pw").await.unwrap();
        let body = origin.body_for_persistence("henry").await.unwrap();
        let pk = origin.public_key("henry").await.unwrap();

        let restarted = Vault::new();
        restarted.register_locked("henry", pk, &body).await.unwrap();
        assert_eq!(restarted.lock_state("henry").await.unwrap(), LockState::Locked);
        restarted.unlock("henry", "pw").await.unwrap();
        assert_eq!(restarted.public_key("henry").await.unwrap(), pk);
    }
}
