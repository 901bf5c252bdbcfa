//! Daemon configuration file (spec §6).
//!
//! Loaded once at startup from JSON on disk. Fields the core doesn't act on
//! (`authPort`/`authHost`/`jwtSecret`/`allowedOrigins`/`requireAuth`,
//! `killSwitch.*`) are still parsed and retained so a future dashboard layer
//! can read them back off the same struct — see §10.3.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::KeyBody;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NostrConfig {
    #[serde(default)]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// The process identity key: nsec or hex.
    pub key: Option<String>,
    /// Persistent admin secret consulted in the connect handshake.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KillSwitchConfig {
    #[serde(rename = "adminNpub")]
    pub admin_npub: Option<String>,
    #[serde(rename = "adminRelays")]
    pub admin_relays: Vec<String>,
    #[serde(rename = "dmType")]
    pub dm_type: Option<String>,
}

/// One entry of the `keys` config map: a name to a `KeyBody` (spec §3).
pub type ConfiguredKey = KeyBody;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub keys: HashMap<String, ConfiguredKey>,
    #[serde(rename = "baseUrl", default)]
    pub base_url: Option<String>,

    // Dashboard/HTTP fields: inert in the core, retained verbatim.
    #[serde(rename = "authPort", default)]
    pub auth_port: Option<u16>,
    #[serde(rename = "authHost", default)]
    pub auth_host: Option<String>,
    #[serde(rename = "jwtSecret", default)]
    pub jwt_secret: Option<String>,
    #[serde(rename = "allowedOrigins", default)]
    pub allowed_origins: Vec<String>,
    #[serde(rename = "requireAuth", default)]
    pub require_auth: bool,

    #[serde(rename = "killSwitch", default)]
    pub kill_switch: KillSwitchConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    pub fn default_relays() -> Vec<String> {
        vec![
            "wss://relay.damus.io".to_string(),
            "wss://nos.lol".to_string(),
            "wss://relay.nsec.app".to_string(),
        ]
    }

    pub fn relays_or_default(&self) -> Vec<String> {
        if self.nostr.relays.is_empty() {
            Self::default_relays()
        } else {
            self.nostr.relays.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{"nostr":{"relays":["wss://relay.damus.io"]},"admin":{"secret":"abc"}}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.nostr.relays, vec!["wss://relay.damus.io".to_string()]);
        assert_eq!(cfg.admin.secret.as_deref(), Some("abc"));
        assert!(cfg.keys.is_empty());
        assert!(!cfg.require_auth);
    }

    #[test]
    fn empty_relays_fall_back_to_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.relays_or_default(), Config::default_relays());
    }
}
