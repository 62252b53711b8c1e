//! The synchronization engine.
//!
//! One long-lived task owns all engine state - the current identity and the
//! pending push deadline - and receives every input (identity changes, local
//! writes, manual sync requests) over a single command channel. Remote
//! operations therefore never interleave: a debounce-triggered push cannot
//! race a pull started by a fresh sign-in, and a write arriving while a push
//! is in flight queues behind it and arms a fresh debounce timer afterwards.
//!
//! Conflict resolution is coarse last-writer-wins over whole snapshots: the
//! unit of conflict is the dataset collection, the tiebreak is the remote
//! record's server-assigned write time against the local update marker. This
//! suits a single-user-multi-device setting; convergent merging of concurrent
//! edits is out of scope.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::events::{SyncEvent, SyncStatus};
use crate::models::{Identity, SyncRecord};
use crate::remote::RemoteStore;
use crate::store::LocalStore;

// ============================================================================
// Constants
// ============================================================================

/// Quiet interval after the last local write before a push fires.
/// Coalesces bursts of edits into a single remote write.
const DEBOUNCE_QUIET_MS: u64 = 2000;

/// How long the transient "saved" status is shown before reverting to
/// "synced".
const SAVED_REVERT_MS: u64 = 2000;

/// Buffer size for the engine command channel.
/// Commands are tiny and local-write notifications coalesce, so 32 gives
/// bursts of writes plenty of headroom.
const COMMAND_BUFFER_SIZE: usize = 32;

/// Buffer size for the notification broadcast channel.
const EVENT_BUFFER_SIZE: usize = 16;

// ============================================================================
// Commands and configuration
// ============================================================================

#[derive(Debug)]
pub(crate) enum Command {
    IdentityChanged(Option<Identity>),
    LocalWrite,
    SyncNow,
    Shutdown,
}

/// Engine timing knobs. Defaults match the shipped behavior; tests shrink or
/// pause them.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub saved_revert: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEBOUNCE_QUIET_MS),
            saved_revert: Duration::from_millis(SAVED_REVERT_MS),
        }
    }
}

/// Handle for notifying the engine of local writes.
///
/// Owned by the `SyncedStore` decorator; cloneable and cheap.
#[derive(Clone)]
pub struct WriteHook {
    tx: Option<mpsc::Sender<Command>>,
}

impl WriteHook {
    /// A hook with no engine behind it, for writing through the store
    /// decorator while no engine is running (e.g. signed out). Writes still
    /// update the local update marker; notifications go nowhere.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Notify the engine that a local mutation happened.
    ///
    /// `try_send` keeps the write path synchronous. A full channel means the
    /// engine already has write notifications queued, so dropping one loses
    /// nothing.
    pub fn notify(&self) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(Command::LocalWrite) {
            debug!(error = %e, "write notification dropped");
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(tx: mpsc::Sender<Command>) -> Self {
        Self { tx: Some(tx) }
    }
}

// ============================================================================
// Engine handle
// ============================================================================

/// Handle to the engine task. Construct once at application start.
pub struct SyncEngine {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
    event_tx: broadcast::Sender<SyncEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncEngine {
    /// Spawn the engine task over a raw local store and a remote store.
    ///
    /// The store handed in here must be the undecorated one: the engine
    /// writes through it when applying a pull, and those writes must not
    /// schedule a push.
    pub fn start(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (status_tx, status_rx) = watch::channel(SyncStatus::LocalOnly);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let worker = Worker {
            store,
            remote,
            config,
            identity: None,
            status: status_tx,
            events: event_tx.clone(),
        };
        let task = tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            status_rx,
            event_tx,
            task,
        }
    }

    /// Hook for the `SyncedStore` write-interception decorator.
    pub fn write_hook(&self) -> WriteHook {
        WriteHook {
            tx: Some(self.cmd_tx.clone()),
        }
    }

    /// Forward identity changes from a session subscription into the engine.
    /// Delivers the current value immediately, then once per transition.
    pub fn attach_session(&self, mut session: watch::Receiver<Option<Identity>>) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                let identity = session.borrow_and_update().clone();
                if tx.send(Command::IdentityChanged(identity)).await.is_err() {
                    break;
                }
                if session.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Report an identity change directly (for callers without a watch feed).
    pub async fn on_identity_change(&self, identity: Option<Identity>) {
        let _ = self.cmd_tx.send(Command::IdentityChanged(identity)).await;
    }

    /// Manual sync trigger.
    pub async fn sync_now(&self) {
        let _ = self.cmd_tx.send(Command::SyncNow).await;
    }

    /// Current and future sync status for display.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the engine, discarding any pending debounced push.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

// ============================================================================
// Worker task
// ============================================================================

struct Worker {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    identity: Option<Identity>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        // Deadlines are Options so the matching select arms can be disabled
        // when nothing is scheduled.
        let mut pending_push: Option<Instant> = None;
        let mut revert_at: Option<Instant> = None;

        loop {
            let push_deadline = pending_push.unwrap_or_else(Instant::now);
            let revert_deadline = revert_at.unwrap_or_else(Instant::now);

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::IdentityChanged(identity)) => {
                        self.handle_identity_change(identity, &mut pending_push, &mut revert_at)
                            .await;
                    }
                    Some(Command::LocalWrite) => {
                        // Cancel-and-reschedule: the newest write always
                        // restarts the quiet interval. Nothing is scheduled
                        // while signed out.
                        if self.identity.is_some() {
                            pending_push = Some(Instant::now() + self.config.debounce);
                        }
                    }
                    Some(Command::SyncNow) => self.manual_sync(&mut revert_at).await,
                    Some(Command::Shutdown) | None => break,
                },
                _ = sleep_until(push_deadline), if pending_push.is_some() => {
                    pending_push = None;
                    self.push(&mut revert_at).await;
                }
                _ = sleep_until(revert_deadline), if revert_at.is_some() => {
                    revert_at = None;
                    if *self.status.borrow() == SyncStatus::Saved {
                        self.set_status(SyncStatus::Synced);
                    }
                }
            }
        }
        debug!("sync engine stopped");
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine; notifications are best effort.
        let _ = self.events.send(event);
    }

    async fn handle_identity_change(
        &mut self,
        identity: Option<Identity>,
        pending_push: &mut Option<Instant>,
        revert_at: &mut Option<Instant>,
    ) {
        match identity {
            Some(identity) => {
                let was_signed_out = self.identity.is_none();
                self.identity = Some(identity.clone());
                if was_signed_out {
                    info!(user = %identity.label, "signed in");
                    self.emit(SyncEvent::SignedIn {
                        label: identity.label,
                    });
                    self.set_status(SyncStatus::Syncing);
                    self.pull_and_reconcile(revert_at).await;
                    // Deliberate even after a failed pull: the failure was
                    // already reported as an event and the status set has no
                    // error state, so the badge must not stick on "syncing".
                    if *self.status.borrow() == SyncStatus::Syncing {
                        self.set_status(SyncStatus::Synced);
                    }
                }
            }
            None => {
                if self.identity.take().is_some() {
                    info!("signed out");
                    // Engine-owned state is cleared; local data stays put.
                    *pending_push = None;
                    self.emit(SyncEvent::SignedOut);
                }
                self.set_status(SyncStatus::LocalOnly);
            }
        }
    }

    /// Fetch the remote record for the current identity and settle which copy
    /// wins. A fetch failure is reported and leaves local state untouched;
    /// the next sign-in or mutation retries naturally.
    async fn pull_and_reconcile(&mut self, revert_at: &mut Option<Instant>) {
        let Some(identity) = self.identity.clone() else {
            return;
        };

        match self.remote.fetch(&identity.user_id).await {
            Err(e) => {
                error!(error = %e, "cloud sync failed");
                self.emit(SyncEvent::CloudSyncFailed {
                    reason: e.to_string(),
                });
            }
            Ok(None) => {
                // First sync for this account: seed the cloud from local.
                debug!("no remote record, seeding cloud from local data");
                self.push(revert_at).await;
            }
            Ok(Some(record)) => {
                let local = match self.store.marker() {
                    Ok(marker) => marker,
                    Err(e) => {
                        warn!(error = %e, "failed to read local update marker");
                        None
                    }
                };
                let remote_wins = match local {
                    // No marker at all means this device has never written.
                    None => true,
                    Some(local) => record.write_time_ms() > local.timestamp_millis(),
                };
                if remote_wins {
                    self.apply_remote(record);
                } else {
                    debug!("local copy is newer, uploading to cloud");
                    self.push(revert_at).await;
                }
            }
        }
    }

    /// Overwrite local datasets with the keys present in the remote record.
    /// Datasets the record does not mention are left untouched.
    fn apply_remote(&mut self, record: SyncRecord) {
        let mut applied = 0usize;
        for (key, value) in record.datasets {
            match self.store.put_dataset(key, value) {
                Ok(()) => applied += 1,
                Err(e) => error!(dataset = %key, error = %e, "failed to apply remote dataset"),
            }
        }
        // The pulled state is now the local baseline; without this the next
        // quiet interval would immediately push it back.
        if let Err(e) = self.store.set_marker(Utc::now()) {
            warn!(error = %e, "failed to update local update marker");
        }
        info!(datasets = applied, by = ?record.updated_by, "synced from cloud");
        self.set_status(SyncStatus::Synced);
        self.emit(SyncEvent::SyncedFromCloud);
        self.emit(SyncEvent::DataRefreshed);
    }

    /// Push the full local snapshot to the remote store. Returns whether the
    /// write landed. Failures are reported; there is no automatic retry - the
    /// next mutation or sign-in tries again.
    async fn push(&mut self, revert_at: &mut Option<Instant>) -> bool {
        let Some(identity) = self.identity.clone() else {
            debug!("not signed in, skipping cloud save");
            return false;
        };

        let snapshot = match self.store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "failed to read local snapshot");
                self.emit(SyncEvent::CloudSaveFailed {
                    reason: e.to_string(),
                });
                return false;
            }
        };

        match self
            .remote
            .upsert(&identity.user_id, snapshot, &identity.label)
            .await
        {
            Ok(()) => {
                debug!("snapshot saved to cloud");
                self.set_status(SyncStatus::Saved);
                *revert_at = Some(Instant::now() + self.config.saved_revert);
                true
            }
            Err(e) => {
                error!(error = %e, "cloud save failed");
                self.emit(SyncEvent::CloudSaveFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    async fn manual_sync(&mut self, revert_at: &mut Option<Instant>) {
        if self.identity.is_none() {
            self.emit(SyncEvent::ManualSyncNotSignedIn);
            return;
        }
        self.set_status(SyncStatus::Syncing);
        if self.push(revert_at).await {
            self.emit(SyncEvent::ManualSyncComplete);
        } else if *self.status.borrow() == SyncStatus::Syncing {
            self.set_status(SyncStatus::Synced);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetKey, Snapshot};
    use crate::remote::RemoteError;
    use crate::store::SyncedStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MemStore {
        datasets: Mutex<BTreeMap<DatasetKey, Value>>,
        marker: Mutex<Option<DateTime<Utc>>>,
    }

    impl LocalStore for MemStore {
        fn dataset(&self, key: DatasetKey) -> Result<Option<Value>> {
            Ok(self.datasets.lock().unwrap().get(&key).cloned())
        }

        fn put_dataset(&self, key: DatasetKey, value: Value) -> Result<()> {
            self.datasets.lock().unwrap().insert(key, value);
            Ok(())
        }

        fn marker(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(*self.marker.lock().unwrap())
        }

        fn set_marker(&self, at: DateTime<Utc>) -> Result<()> {
            *self.marker.lock().unwrap() = Some(at);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemRemote {
        record: Mutex<Option<SyncRecord>>,
        upserts: AtomicUsize,
        fail_fetch: AtomicBool,
        fail_upsert: AtomicBool,
    }

    impl MemRemote {
        fn upsert_count(&self) -> usize {
            self.upserts.load(Ordering::SeqCst)
        }

        fn seed(&self, record: SyncRecord) {
            *self.record.lock().unwrap() = Some(record);
        }
    }

    #[async_trait]
    impl RemoteStore for MemRemote {
        async fn fetch(&self, _user_id: &str) -> Result<Option<SyncRecord>, RemoteError> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(RemoteError::ServerError("fetch down".into()));
            }
            Ok(self.record.lock().unwrap().clone())
        }

        async fn upsert(
            &self,
            _user_id: &str,
            datasets: Snapshot,
            updated_by: &str,
        ) -> Result<(), RemoteError> {
            if self.fail_upsert.load(Ordering::SeqCst) {
                return Err(RemoteError::ServerError("upsert down".into()));
            }
            self.upserts.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.record.lock().unwrap();
            let record = guard.get_or_insert_with(SyncRecord::default);
            // Merge semantics: incoming keys replace, absent keys survive.
            for (key, value) in datasets {
                record.datasets.insert(key, value);
            }
            record.updated_at = Some(Utc::now());
            record.updated_by = Some(updated_by.to_string());
            Ok(())
        }
    }

    fn identity() -> Identity {
        Identity {
            user_id: "u1".into(),
            label: "u1@example.com".into(),
        }
    }

    fn engine(
        store: &Arc<MemStore>,
        remote: &Arc<MemRemote>,
    ) -> SyncEngine {
        SyncEngine::start(
            Arc::clone(store) as Arc<dyn LocalStore>,
            Arc::clone(remote) as Arc<dyn RemoteStore>,
            SyncConfig::default(),
        )
    }

    /// Let the paused clock advance only after every task has gone idle,
    /// which also guarantees the engine has drained its command queue.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ------------------------------------------------------------------
    // Debounce
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_coalesces_into_one_push() {
        let store = Arc::new(MemStore::default());
        // Local marker newer than the cloud so sign-in pushes once.
        store.set_marker(Utc::now()).unwrap();
        store
            .put_dataset(DatasetKey::Accounts, json!([{"name": "a"}]))
            .unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;
        let baseline = remote.upsert_count();

        let synced = SyncedStore::new(
            Arc::clone(&store) as Arc<dyn LocalStore>,
            engine.write_hook(),
        );
        for i in 0..5 {
            synced
                .put_dataset(DatasetKey::Accounts, json!([{"edit": i}]))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(remote.upsert_count(), baseline, "no push inside the burst");

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(remote.upsert_count(), baseline + 1, "exactly one push");

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_inflight_push_schedules_another() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;
        let baseline = remote.upsert_count();

        let synced = SyncedStore::new(
            Arc::clone(&store) as Arc<dyn LocalStore>,
            engine.write_hook(),
        );
        synced.put_dataset(DatasetKey::Cards, json!([1])).unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(remote.upsert_count(), baseline + 1);

        // A later write is not swallowed by the completed push.
        synced.put_dataset(DatasetKey::Cards, json!([2])).unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(remote.upsert_count(), baseline + 2);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_push_while_signed_out() {
        let store = Arc::new(MemStore::default());
        let remote = Arc::new(MemRemote::default());
        let engine = engine(&store, &remote);

        let synced = SyncedStore::new(
            Arc::clone(&store) as Arc<dyn LocalStore>,
            engine.write_hook(),
        );
        synced
            .put_dataset(DatasetKey::Holdings, json!([{"symbol": "VT"}]))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(remote.upsert_count(), 0);
        // The marker still tracks the local mutation.
        assert!(store.marker().unwrap().is_some());

        engine.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn remote_newer_overwrites_local_and_resets_marker() {
        let t0 = Utc::now();
        let store = Arc::new(MemStore::default());
        store.set_marker(t0).unwrap();
        store
            .put_dataset(DatasetKey::Accounts, json!([{"name": "local"}]))
            .unwrap();

        let remote = Arc::new(MemRemote::default());
        let mut datasets = Snapshot::new();
        datasets.insert(DatasetKey::Accounts, json!([{"name": "cloud"}]));
        remote.seed(SyncRecord {
            datasets,
            updated_at: Some(t0 + chrono::Duration::seconds(1)),
            updated_by: Some("other@example.com".into()),
        });

        let engine = engine(&store, &remote);
        let mut events = engine.subscribe();
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(
            store.dataset(DatasetKey::Accounts).unwrap(),
            Some(json!([{"name": "cloud"}]))
        );
        assert_eq!(remote.upsert_count(), 0);
        // Marker reset: pulled state is the new local baseline.
        assert!(store.marker().unwrap().unwrap() > t0);
        let events = drain(&mut events);
        assert!(events.contains(&SyncEvent::SyncedFromCloud));
        assert!(events.contains(&SyncEvent::DataRefreshed));
        assert_eq!(*engine.status().borrow(), SyncStatus::Synced);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn local_newer_pushes_instead() {
        let t0 = Utc::now();
        let store = Arc::new(MemStore::default());
        store.set_marker(t0 + chrono::Duration::seconds(5)).unwrap();
        store
            .put_dataset(DatasetKey::Accounts, json!([{"name": "local"}]))
            .unwrap();

        let remote = Arc::new(MemRemote::default());
        let mut datasets = Snapshot::new();
        datasets.insert(DatasetKey::Accounts, json!([{"name": "cloud"}]));
        remote.seed(SyncRecord {
            datasets,
            updated_at: Some(t0 + chrono::Duration::seconds(1)),
            updated_by: None,
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(remote.upsert_count(), 1);
        // Local data untouched.
        assert_eq!(
            store.dataset(DatasetKey::Accounts).unwrap(),
            Some(json!([{"name": "local"}]))
        );
        let record = remote.record.lock().unwrap().clone().unwrap();
        assert_eq!(
            record.datasets.get(&DatasetKey::Accounts),
            Some(&json!([{"name": "local"}]))
        );
        assert_eq!(record.updated_by.as_deref(), Some("u1@example.com"));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_marker_means_remote_wins() {
        let store = Arc::new(MemStore::default());
        store
            .put_dataset(DatasetKey::Settings, json!({"theme": "local"}))
            .unwrap();

        let remote = Arc::new(MemRemote::default());
        let mut datasets = Snapshot::new();
        datasets.insert(DatasetKey::Settings, json!({"theme": "cloud"}));
        // Even a record without a write time beats a device that never wrote.
        remote.seed(SyncRecord {
            datasets,
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(
            store.dataset(DatasetKey::Settings).unwrap(),
            Some(json!({"theme": "cloud"}))
        );
        assert_eq!(remote.upsert_count(), 0);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn seed_on_first_sync() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        store
            .put_dataset(DatasetKey::Cards, json!([{"issuer": "visa"}]))
            .unwrap();
        let remote = Arc::new(MemRemote::default());

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(remote.upsert_count(), 1);
        assert_eq!(
            store.dataset(DatasetKey::Cards).unwrap(),
            Some(json!([{"issuer": "visa"}]))
        );

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_remote_record_overwrites_only_present_keys() {
        let t0 = Utc::now();
        let store = Arc::new(MemStore::default());
        store.set_marker(t0).unwrap();
        store
            .put_dataset(DatasetKey::Accounts, json!([{"name": "local"}]))
            .unwrap();
        store
            .put_dataset(DatasetKey::Settings, json!({"theme": "dark"}))
            .unwrap();

        let remote = Arc::new(MemRemote::default());
        let mut datasets = Snapshot::new();
        datasets.insert(DatasetKey::Accounts, json!([{"name": "cloud"}]));
        remote.seed(SyncRecord {
            datasets,
            updated_at: Some(t0 + chrono::Duration::seconds(1)),
            updated_by: None,
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(
            store.dataset(DatasetKey::Accounts).unwrap(),
            Some(json!([{"name": "cloud"}]))
        );
        // Settings were absent from the record and stay untouched.
        assert_eq!(
            store.dataset(DatasetKey::Settings).unwrap(),
            Some(json!({"theme": "dark"}))
        );

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_leaves_local_state_alone() {
        let store = Arc::new(MemStore::default());
        store
            .put_dataset(DatasetKey::Accounts, json!([{"name": "local"}]))
            .unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.fail_fetch.store(true, Ordering::SeqCst);

        let engine = engine(&store, &remote);
        let mut events = engine.subscribe();
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert_eq!(
            store.dataset(DatasetKey::Accounts).unwrap(),
            Some(json!([{"name": "local"}]))
        );
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::CloudSyncFailed { .. })));

        engine.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Sign-out and manual sync
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sign_out_preserves_local_data_and_cancels_pending_push() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;
        let baseline = remote.upsert_count();

        let synced = SyncedStore::new(
            Arc::clone(&store) as Arc<dyn LocalStore>,
            engine.write_hook(),
        );
        synced
            .put_dataset(DatasetKey::Alerts, json!([{"symbol": "VT"}]))
            .unwrap();
        // Sign out before the quiet interval elapses.
        engine.on_identity_change(None).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(remote.upsert_count(), baseline, "pending push was cancelled");
        assert_eq!(
            store.dataset(DatasetKey::Alerts).unwrap(),
            Some(json!([{"symbol": "VT"}])),
            "local data survives sign-out"
        );
        assert_eq!(*engine.status().borrow(), SyncStatus::LocalOnly);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sync_requires_sign_in() {
        let store = Arc::new(MemStore::default());
        let remote = Arc::new(MemRemote::default());
        let engine = engine(&store, &remote);
        let mut events = engine.subscribe();

        engine.sync_now().await;
        settle().await;

        assert_eq!(remote.upsert_count(), 0);
        assert!(drain(&mut events).contains(&SyncEvent::ManualSyncNotSignedIn));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sync_pushes_and_reports_completion() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;
        let baseline = remote.upsert_count();
        let mut events = engine.subscribe();

        engine.sync_now().await;
        settle().await;

        assert_eq!(remote.upsert_count(), baseline + 1);
        assert!(drain(&mut events).contains(&SyncEvent::ManualSyncComplete));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn saved_status_reverts_to_synced() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });

        let engine = engine(&store, &remote);
        engine.on_identity_change(Some(identity())).await;
        settle().await;
        // Sign-in pushed (local newer), so the transient state is visible.
        assert_eq!(*engine.status().borrow(), SyncStatus::Saved);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(*engine.status().borrow(), SyncStatus::Synced);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_failure_is_reported_not_retried() {
        let store = Arc::new(MemStore::default());
        store.set_marker(Utc::now()).unwrap();
        let remote = Arc::new(MemRemote::default());
        remote.seed(SyncRecord {
            updated_at: Some(Utc.timestamp_opt(1, 0).unwrap()),
            ..Default::default()
        });
        remote.fail_upsert.store(true, Ordering::SeqCst);

        let engine = engine(&store, &remote);
        let mut events = engine.subscribe();
        engine.on_identity_change(Some(identity())).await;
        settle().await;

        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::CloudSaveFailed { .. })));
        // No retry loop: the count stays put even as time passes.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.upsert_count(), 0);

        engine.shutdown().await;
    }
}
