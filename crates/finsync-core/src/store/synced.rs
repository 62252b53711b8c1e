//! Write interception for the local store.
//!
//! `SyncedStore` wraps a [`LocalStore`] once, at composition time. Every write
//! performed through it, regardless of call site, updates the local update
//! marker and nudges the sync engine so it can schedule a debounced push.
//! Reads pass through untouched, and call sites keep the plain store contract.
//!
//! The sync engine itself writes through the raw inner store when applying a
//! pull, so incoming remote data never schedules a push of its own.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::DatasetKey;
use crate::store::LocalStore;
use crate::sync::WriteHook;

pub struct SyncedStore {
    inner: Arc<dyn LocalStore>,
    hook: WriteHook,
}

impl SyncedStore {
    pub fn new(inner: Arc<dyn LocalStore>, hook: WriteHook) -> Self {
        Self { inner, hook }
    }
}

impl LocalStore for SyncedStore {
    fn dataset(&self, key: DatasetKey) -> Result<Option<Value>> {
        self.inner.dataset(key)
    }

    fn put_dataset(&self, key: DatasetKey, value: Value) -> Result<()> {
        self.inner.put_dataset(key, value)?;
        self.inner.set_marker(Utc::now())?;
        self.hook.notify();
        Ok(())
    }

    fn marker(&self) -> Result<Option<DateTime<Utc>>> {
        self.inner.marker()
    }

    fn set_marker(&self, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_marker(at)
    }
}
