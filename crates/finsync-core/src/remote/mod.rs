//! Remote document store: one merge-upserted document per user.

mod http;

pub use http::HttpRemote;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Snapshot, SyncRecord};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Unauthorized - session token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::AccessDenied(truncated),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(truncated),
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

/// Per-user document store reachable over the network.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the sync record for a user, or `None` when no document exists
    /// yet for that identity.
    async fn fetch(&self, user_id: &str) -> Result<Option<SyncRecord>, RemoteError>;

    /// Merge-upsert the snapshot into the user's document.
    ///
    /// Fields already present in the stored document but absent from
    /// `datasets` are preserved by the store, and the store assigns the
    /// record's write timestamp - both are store-level contracts, not caller
    /// logic.
    async fn upsert(
        &self,
        user_id: &str,
        datasets: Snapshot,
        updated_by: &str,
    ) -> Result<(), RemoteError>;
}
