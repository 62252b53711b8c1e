//! Observable sync state and notifications.

/// Sync state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Signed out; data lives on this device only.
    LocalOnly,
    /// Local and remote copies agree as of the last sync.
    Synced,
    /// A pull or manual sync is in flight.
    Syncing,
    /// A push just landed; reverts to `Synced` shortly after.
    Saved,
}

impl SyncStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::LocalOnly => "local only",
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Saved => "saved",
        }
    }
}

/// Notifications emitted by the sync engine.
///
/// Views subscribe explicitly; nothing probes for globally-named refresh
/// hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SignedIn { label: String },
    SignedOut,
    /// Remote won the reconciliation and local datasets were replaced.
    SyncedFromCloud,
    /// Local data changed under a subscriber's feet; refresh bound views.
    DataRefreshed,
    CloudSaveFailed { reason: String },
    CloudSyncFailed { reason: String },
    ManualSyncComplete,
    ManualSyncNotSignedIn,
}
