//! Session provider: the authenticated identity and its change feed.
//!
//! The identity-provider login flow itself lives outside this crate; a
//! successful login hands an [`Identity`] to the provider, which fans the
//! change out to subscribers over a watch channel. The channel delivers the
//! current value on subscription and once per sign-in/sign-out transition.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::models::Identity;

/// Session file name in the data directory.
const SESSION_FILE: &str = "session.json";

/// Sign-in failure taxonomy. A user dismissing the provider's login flow is
/// not an error and should be surfaced at info level only.
#[derive(Error, Debug)]
pub enum SignInError {
    #[error("sign-in cancelled")]
    Cancelled,

    #[error("sign-in failed: {0}")]
    Failed(String),
}

impl SignInError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SignInError::Cancelled)
    }
}

/// Supplies the current authenticated identity (or none) and a subscription
/// to identity changes.
pub struct SessionProvider {
    tx: watch::Sender<Option<Identity>>,
}

impl SessionProvider {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    pub fn signed_in(&self, identity: Identity) {
        self.tx.send_replace(Some(identity));
    }

    pub fn signed_out(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity persisted across runs so the application can restore the
/// signed-in state without repeating the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub user_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            label: self.email.clone(),
        }
    }

    /// Load the session from disk, if one was saved.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let session = serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(SESSION_FILE), contents).context("Failed to write session file")?;
        Ok(())
    }

    pub fn clear(dir: &Path) -> Result<()> {
        let path = dir.join(SESSION_FILE);
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}
