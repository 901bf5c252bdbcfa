//! Durable row types for the repository abstraction (spec §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Paranoid,
    Reasonable,
    Full,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paranoid => "paranoid",
            Self::Reasonable => "reasonable",
            Self::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paranoid" => Some(Self::Paranoid),
            "reasonable" => Some(Self::Reasonable),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// A pairing between a local key and a remote client's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub key_name: String,
    pub remote_pubkey: String,
    pub description: Option<String>,
    pub trust_level: TrustLevel,
    pub custom_relays: Vec<String>,
    pub suspended_at: Option<i64>,
    pub suspend_until: Option<i64>,
    pub revoked_at: Option<i64>,
    pub created_at: i64,
    pub last_used_at: i64,
}

impl App {
    pub fn is_suspended(&self, now: i64) -> bool {
        match self.suspended_at {
            None => false,
            Some(_) => match self.suspend_until {
                None => true,
                Some(until) => now < until,
            },
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// A per-app rule: "always allow/deny this method (and optionally kind)".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPermission {
    pub key_name: String,
    pub remote_pubkey: String,
    pub method: String,
    pub kind: Option<u64>,
    pub allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Manual,
    AutoTrust,
    AutoPermission,
}

/// A request awaiting (or having received) a human/policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub key_name: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params_json: String,
    pub created_at: i64,
    /// `None` = undecided, `Some(true)` = approved, `Some(false)` = denied.
    pub decision: Option<bool>,
    pub decided_at: Option<i64>,
    pub approval_type: Option<ApprovalType>,
}

/// A one-shot capability letting a specific app connect to a specific key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionToken {
    pub token: String,
    pub key_name: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub redeemed_at: Option<i64>,
    pub policy_template: Option<String>,
}

impl ConnectionToken {
    pub fn is_usable(&self, now: i64) -> bool {
        self.redeemed_at.is_none() && now < self.expires_at
    }
}

/// Append-only administrative event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub key_name: Option<String>,
    pub kind: String,
    pub detail: String,
    pub at: i64,
}

/// Singleton inactivity-lock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadManSwitchState {
    pub enabled: bool,
    pub timeframe_sec: i64,
    pub last_reset_at: i64,
    pub panic_triggered_at: Option<i64>,
    pub warnings_sent: Vec<i64>,
}

impl Default for DeadManSwitchState {
    fn default() -> Self {
        Self {
            enabled: false,
            timeframe_sec: 0,
            last_reset_at: 0,
            panic_triggered_at: None,
            warnings_sent: Vec::new(),
        }
    }
}

/// Body variants of a `KeyRecord` as persisted (spec §3). `None` means the
/// key carries no at-rest wrapping (bare plaintext, loaded into memory at
/// startup and never locked).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyBody {
    Plaintext { secret_hex: String },
    LegacyCiphertext { blob: Vec<u8> },
    Nip49Wrapped { ncryptsec: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub name: String,
    pub public_key_hex: String,
    pub body: KeyBody,
    pub admin_secret: Option<String>,
}

impl KeyRecord {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self.body, KeyBody::Plaintext { .. })
    }
}
