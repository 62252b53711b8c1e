//! Core data types shared by the local store, the sync engine, and the
//! remote document store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named category of user records, stored and synced as an atomic unit.
///
/// The set is fixed; payloads are opaque JSON owned by the record views.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKey {
    Accounts,
    Cards,
    Holdings,
    OtherAssets,
    FundPositions,
    Settings,
    Alerts,
}

impl DatasetKey {
    /// Every dataset the application stores, in stable order.
    pub const ALL: [DatasetKey; 7] = [
        DatasetKey::Accounts,
        DatasetKey::Cards,
        DatasetKey::Holdings,
        DatasetKey::OtherAssets,
        DatasetKey::FundPositions,
        DatasetKey::Settings,
        DatasetKey::Alerts,
    ];

    /// Stable name used for storage file names and remote document fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKey::Accounts => "accounts",
            DatasetKey::Cards => "cards",
            DatasetKey::Holdings => "holdings",
            DatasetKey::OtherAssets => "other_assets",
            DatasetKey::FundPositions => "fund_positions",
            DatasetKey::Settings => "settings",
            DatasetKey::Alerts => "alerts",
        }
    }

    /// Parse a stable name back into a key (e.g. from a CLI argument).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.as_str() == name)
    }
}

impl std::fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full collection of dataset payloads at a point in time.
///
/// A snapshot is only ever replaced wholesale per key, never merged
/// field-by-field.
pub type Snapshot = BTreeMap<DatasetKey, serde_json::Value>;

/// The remote-stored form of a snapshot; one record per user id.
///
/// A record may carry any subset of dataset keys - readers overwrite exactly
/// the keys present and leave the rest of the local data untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRecord {
    #[serde(default)]
    pub datasets: Snapshot,
    /// Write time assigned by the remote store at upsert. Absent on legacy or
    /// malformed documents.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Display label of the writer (email).
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl SyncRecord {
    /// Write timestamp in milliseconds since the epoch; 0 when absent, the
    /// "oldest possible" reading used by the reconciliation tie-break.
    pub fn write_time_ms(&self) -> i64 {
        self.updated_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

/// The authenticated principal supplied by the session provider.
///
/// Held by the sync engine only while signed in; destroyed on sign-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable unique identifier; addresses the user's remote document.
    pub user_id: String,
    /// Display label (email or name) recorded as the writer of a push.
    pub label: String,
}
