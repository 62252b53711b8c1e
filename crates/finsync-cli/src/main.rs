//! finsync - offline-first personal finance data with cloud sync.
//!
//! Thin command-line front end over the `finsync-core` library: inspect and
//! edit local datasets, drive the sync engine manually, and manage the
//! offline resource cache.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{timeout, Duration};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use finsync_core::config::Config;
use finsync_core::events::{SyncEvent, SyncStatus};
use finsync_core::models::DatasetKey;
use finsync_core::offline::{HttpFetcher, ResourceCache};
use finsync_core::remote::HttpRemote;
use finsync_core::session::StoredSession;
use finsync_core::store::{JsonFileStore, LocalStore, SyncedStore};
use finsync_core::sync::{SyncConfig, SyncEngine, WriteHook};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for a sync round trip before giving up (in seconds)
const SYNC_WAIT_SECS: u64 = 30;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Set up logging with environment-based filter
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn usage() {
    eprintln!("Usage: finsync <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                   Show session, datasets and cache state");
    eprintln!("  login <user_id> <email>  Store a session for cloud sync");
    eprintln!("  logout                   Clear the stored session (local data kept)");
    eprintln!("  sync                     Pull, reconcile and push now");
    eprintln!("  get <dataset>            Print a local dataset");
    eprintln!("  set <dataset> <json>     Replace a local dataset (schedules a push)");
    eprintln!("  cache-install            Install and activate the offline cache");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("status") => status().await,
        Some("login") if args.len() == 4 => login(&args[2], &args[3]),
        Some("logout") => logout(),
        Some("sync") => sync().await,
        Some("get") if args.len() == 3 => get(&args[2]),
        Some("set") if args.len() == 4 => set(&args[2], &args[3]).await,
        Some("cache-install") => cache_install().await,
        _ => {
            usage();
            std::process::exit(2);
        }
    }
}

fn open_store() -> Result<Arc<JsonFileStore>> {
    Ok(Arc::new(JsonFileStore::new(Config::data_dir()?)?))
}

fn parse_key(name: &str) -> Result<DatasetKey> {
    DatasetKey::parse(name).ok_or_else(|| {
        let known: Vec<&str> = DatasetKey::ALL.iter().map(|k| k.as_str()).collect();
        anyhow::anyhow!("Unknown dataset '{}'. Known datasets: {}", name, known.join(", "))
    })
}

fn describe(event: &SyncEvent) -> String {
    match event {
        SyncEvent::SignedIn { label } => format!("signed in as {label}"),
        SyncEvent::SignedOut => "signed out".to_string(),
        SyncEvent::SyncedFromCloud => "cloud copy was newer; local data replaced".to_string(),
        SyncEvent::DataRefreshed => "local data refreshed".to_string(),
        SyncEvent::CloudSaveFailed { reason } => format!("cloud save failed: {reason}"),
        SyncEvent::CloudSyncFailed { reason } => format!("cloud sync failed: {reason}"),
        SyncEvent::ManualSyncComplete => "sync complete".to_string(),
        SyncEvent::ManualSyncNotSignedIn => "not signed in; nothing to sync".to_string(),
    }
}

/// Build the engine for the stored session, attach the identity, and wait for
/// the sign-in pull to settle.
async fn start_engine(config: &Config, session: &StoredSession) -> Result<SyncEngine> {
    let store = open_store()?;
    let mut remote = HttpRemote::new(&config.remote_url)?;
    if let Ok(token) = std::env::var("FINSYNC_TOKEN") {
        remote.set_token(token);
    }
    let engine = SyncEngine::start(
        store as Arc<dyn LocalStore>,
        Arc::new(remote),
        SyncConfig::default(),
    );
    engine.on_identity_change(Some(session.identity())).await;

    let mut status = engine.status();
    timeout(
        Duration::from_secs(SYNC_WAIT_SECS),
        status.wait_for(|s| matches!(s, SyncStatus::Synced | SyncStatus::Saved)),
    )
    .await
    .context("Timed out waiting for initial sync")?
    .context("Sync engine stopped unexpectedly")?;
    Ok(engine)
}

async fn status() -> Result<()> {
    let config = Config::load()?;
    let data_dir = Config::data_dir()?;

    match StoredSession::load(&data_dir)? {
        Some(session) => println!("Session:  {} ({})", session.email, session.user_id),
        None => println!("Session:  signed out (data stays on this device)"),
    }

    let store = open_store()?;
    match store.marker()? {
        Some(at) => println!("Last local change: {}", at.to_rfc3339()),
        None => println!("Last local change: never"),
    }

    println!("Datasets:");
    for key in DatasetKey::ALL {
        let present = store.dataset(key)?.is_some();
        println!("  {:<16} {}", key.as_str(), if present { "present" } else { "-" });
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.app_origin)?);
    let cache = ResourceCache::new(
        Config::cache_dir()?,
        &config.cache_version,
        &config.entry_point,
        fetcher,
    )?;
    println!("Offline cache: version {} (on disk: {})",
        config.cache_version,
        cache.versions()?.join(", "));
    Ok(())
}

fn login(user_id: &str, email: &str) -> Result<()> {
    let data_dir = Config::data_dir()?;
    let session = StoredSession::new(user_id, email);
    session.save(&data_dir)?;

    let mut config = Config::load()?;
    config.last_email = Some(email.to_string());
    config.save()?;

    println!("Signed in as {email}. Run `finsync sync` to reconcile with the cloud.");
    Ok(())
}

fn logout() -> Result<()> {
    StoredSession::clear(&Config::data_dir()?)?;
    println!("Signed out. Local data is kept on this device.");
    Ok(())
}

async fn sync() -> Result<()> {
    let config = Config::load()?;
    let session = StoredSession::load(&Config::data_dir()?)?
        .ok_or_else(|| anyhow::anyhow!("Not signed in. Run `finsync login <user_id> <email>`."))?;

    let engine = start_engine(&config, &session).await?;
    let mut events = engine.subscribe();
    engine.sync_now().await;

    loop {
        let event = timeout(Duration::from_secs(SYNC_WAIT_SECS), events.recv())
            .await
            .context("Timed out waiting for sync")?
            .context("Sync engine stopped unexpectedly")?;
        println!("{}", describe(&event));
        match event {
            SyncEvent::ManualSyncComplete
            | SyncEvent::ManualSyncNotSignedIn
            | SyncEvent::CloudSaveFailed { .. } => break,
            _ => {}
        }
    }

    engine.shutdown().await;
    info!("sync finished");
    Ok(())
}

fn get(name: &str) -> Result<()> {
    let key = parse_key(name)?;
    let store = open_store()?;
    match store.dataset(key)? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(not set)"),
    }
    Ok(())
}

async fn set(name: &str, payload: &str) -> Result<()> {
    let key = parse_key(name)?;
    let value: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let config = Config::load()?;
    let session = StoredSession::load(&Config::data_dir()?)?;

    let Some(session) = session else {
        // Signed out: the write lands locally and syncs on the next login.
        let store = SyncedStore::new(open_store()? as Arc<dyn LocalStore>, WriteHook::disconnected());
        store.put_dataset(key, value)?;
        println!("{key} saved locally (signed out, not synced).");
        return Ok(());
    };

    let engine = start_engine(&config, &session).await?;
    let synced = SyncedStore::new(open_store()? as Arc<dyn LocalStore>, engine.write_hook());
    synced.put_dataset(key, value)?;
    println!("{key} saved locally; waiting for cloud save...");

    // The push fires after the debounce quiet interval.
    let mut status = engine.status();
    let wait = SyncConfig::default().debounce + Duration::from_secs(SYNC_WAIT_SECS);
    match timeout(wait, status.wait_for(|s| *s == SyncStatus::Saved)).await {
        Ok(result) => {
            result.context("Sync engine stopped unexpectedly")?;
            println!("Saved to cloud.");
        }
        Err(_) => {
            let mut events = engine.subscribe();
            if let Ok(event) = events.try_recv() {
                println!("{}", describe(&event));
            }
            anyhow::bail!("Cloud save did not complete in time");
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn cache_install() -> Result<()> {
    let config = Config::load()?;
    if config.manifest.is_empty() {
        anyhow::bail!(
            "No cache manifest configured. Add resource URLs to `manifest` in config.json."
        );
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.app_origin)?);
    let cache = ResourceCache::new(
        Config::cache_dir()?,
        &config.cache_version,
        &config.entry_point,
        fetcher,
    )?;

    let summary = cache.install(&config.manifest).await?;
    cache.activate()?;

    println!(
        "Cache {} installed: {} stored, {} failed.",
        config.cache_version, summary.stored, summary.failed
    );
    Ok(())
}
