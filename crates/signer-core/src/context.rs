//! System context (spec §9 "Global/singletons" design note): a single
//! handle constructed at startup and threaded through every component,
//! replacing the module-level globals the teacher uses for its Tauri state
//! (`NOSTR_CLIENT`, `TAURI_APP`, `STATE`, ...). Tests construct a fresh
//! context per test instead of relying on process-wide statics.

use std::sync::Arc;

use crate::authz::cache::DecisionCache;
use crate::bus::EventBus;
use crate::config::Config;
use crate::store::Repository;
use crate::vault::Vault;

/// Shared, cloneable handle to every cross-cutting dependency. Individual
/// components borrow the pieces they need (`ctx.repo`, `ctx.vault`, ...)
/// rather than reaching for a global.
#[derive(Clone)]
pub struct SignerContext {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub vault: Arc<Vault>,
    pub bus: EventBus,
    pub decision_cache: Arc<DecisionCache>,
}

impl SignerContext {
    pub fn new(config: Config, repo: Arc<dyn Repository>) -> Self {
        Self {
            config: Arc::new(config),
            repo,
            vault: Arc::new(Vault::new()),
            bus: EventBus::new(),
            decision_cache: Arc::new(DecisionCache::new()),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::store::sqlite::SqliteRepository;

    /// A fresh in-memory context for unit tests, per spec §9's testing
    /// guidance ("construct a fresh context per test").
    pub fn fresh_context() -> SignerContext {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        SignerContext::new(Config::default(), repo)
    }
}
