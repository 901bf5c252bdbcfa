//! `signerd`: the standalone daemon binary. Loads configuration, opens the
//! sqlite store, brings up `signer-core`'s `Daemon`, prompts for any
//! encrypted key's passphrase, and runs the background tick loops (relay
//! watchdog, subscription health check, inactivity lock) until a shutdown
//! signal arrives.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signer_core::config::Config;
use signer_core::deadman;
use signer_core::relay::pool;
use signer_core::relay::subscription;
use signer_core::store::sqlite::SqliteRepository;
use signer_core::store::Repository;
use signer_core::Daemon;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "signerd", about = "Nostr remote-signing daemon")]
struct Args {
    /// Path to the daemon's JSON configuration file.
    #[arg(long, default_value = "signerd.json")]
    config: PathBuf,

    /// Directory holding the sqlite database and other daemon state.
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let repo = open_repository(&args.base_dir)?;

    let daemon = Arc::new(Daemon::bootstrap(config, repo).await?);
    info!("daemon bootstrapped");

    unlock_configured_keys_interactively(&daemon).await;
    daemon.activate_all_unlocked().await?;

    let (shutdown_fired_tx, mut shutdown_fired_rx) = tokio::sync::oneshot::channel();
    let notification_daemon = daemon.clone();
    tokio::spawn(async move {
        let pool = notification_daemon.relay_pool().clone();
        let result = pool
            .run_notifications(|subscription_id, event| {
                let key_name = subscription_id.to_string().strip_prefix("nip46:").map(str::to_string);
                if let Some(key_name) = key_name {
                    let daemon = notification_daemon.clone();
                    tokio::spawn(async move { daemon.route_event(&key_name, event).await });
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "relay notification loop ended");
        }
        let _ = shutdown_fired_tx.send(());
    });

    let tick_daemon = daemon.clone();
    tokio::spawn(async move { run_background_ticks(tick_daemon).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = &mut shutdown_fired_rx => {
            error!("relay notification loop exited unexpectedly");
        }
    }

    daemon.shutdown().await;
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        warn!(path = %path.display(), "no config file found, starting with defaults");
        Ok(Config::default())
    }
}

fn open_repository(base_dir: &Path) -> anyhow::Result<Arc<dyn Repository>> {
    std::fs::create_dir_all(base_dir)?;
    let db_path = base_dir.join("signer.db");
    let repo = SqliteRepository::open(&db_path)
        .map_err(|e| anyhow::anyhow!("opening {}: {e}", db_path.display()))?;
    Ok(Arc::new(repo))
}

/// For every key that booted locked (legacy or NIP-49 at rest), prompt on
/// stdin for its passphrase. A blank line skips that key — it stays locked
/// until unlocked some other way.
async fn unlock_configured_keys_interactively(daemon: &Daemon) {
    for name in daemon.locked_key_names().await {
        print!("passphrase for key '{name}' (blank to skip): ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            continue;
        }
        let passphrase = line.trim();
        if passphrase.is_empty() {
            warn!(key = %name, "left locked at startup");
            continue;
        }
        match daemon.unlock_key(&name, passphrase).await {
            Ok(()) => info!(key = %name, "unlocked"),
            Err(e) => error!(key = %name, error = %e, "failed to unlock"),
        }
    }
}

/// Drives the three periodic ticks spec'd for the relay layer and the
/// inactivity lock, each on its own cadence, until the process exits.
async fn run_background_ticks(daemon: Arc<Daemon>) {
    let mut watchdog = tokio::time::interval(pool::WATCHDOG_INTERVAL);
    let mut health = tokio::time::interval(subscription::HEALTH_CHECK_INTERVAL);
    let mut deadman_tick = tokio::time::interval(deadman::CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = watchdog.tick() => {
                daemon.relay_pool().watchdog_tick().await;
            }
            _ = health.tick() => {
                daemon.subscriptions().health_check_tick().await;
            }
            _ = deadman_tick.tick() => {
                if let Err(e) = daemon.inactivity_lock().check_tick().await {
                    error!(error = %e, "inactivity lock tick failed");
                }
            }
        }
    }
}
