//! Offline resource cache.
//!
//! Versioned, directory-backed cache of static resources so the application
//! shell keeps working without a network. The lifecycle is strict:
//! `install` populates a version directory from a manifest, `activate` evicts
//! every other version and marks the cache live, and only then may `serve`
//! answer requests (cache first, network fallback, lazy growth).
//!
//! Invalidation is by version tag only. Bumping the tag and re-running
//! install/activate replaces the whole cache; there is no per-entry expiry
//! and no content hashing.

mod fetch;

pub use fetch::{HttpFetcher, ResourceFetcher};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Index file mapping resource URLs to entry file stems.
const INDEX_FILE: &str = "index.json";

/// Concurrent fetches during manifest install.
const MAX_INSTALL_CONCURRENCY: usize = 8;

/// Where a response came from relative to the application origin. Only
/// same-origin responses are trusted into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOrigin {
    Basic,
    Cross,
}

/// A fetched or cached resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub status: u16,
    pub origin: ResponseOrigin,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ResourceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the serve path may store this response lazily: a success from
    /// our own origin. Error pages and third-party responses picked up
    /// outside the manifest are always served fresh.
    pub fn is_cacheable(&self) -> bool {
        self.is_success() && self.origin == ResponseOrigin::Basic
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("offline cache is not active")]
    NotActive,

    #[error("resource fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),
}

/// Outcome of a manifest install. Failures are per-resource and never abort
/// the install.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstallSummary {
    pub stored: usize,
    pub failed: usize,
}

/// On-disk metadata for one cached entry, stored beside its `.bin` body.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    origin: ResponseOrigin,
    content_type: Option<String>,
}

/// URL-to-stem index for one cache version, persisted as `index.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: BTreeMap<String, String>,
    next_id: u64,
}

/// Versioned resource cache rooted at `<cache_root>/<version>/`.
pub struct ResourceCache {
    root: PathBuf,
    version: String,
    entry_point: String,
    fetcher: Arc<dyn ResourceFetcher>,
    index: Mutex<CacheIndex>,
    active: AtomicBool,
}

impl ResourceCache {
    /// Open (or create) the cache for `version`. Serving stays disabled until
    /// [`activate`](Self::activate) runs.
    pub fn new(
        root: impl Into<PathBuf>,
        version: impl Into<String>,
        entry_point: impl Into<String>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self> {
        let root = root.into();
        let version = version.into();
        let dir = root.join(&version);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let contents = std::fs::read_to_string(&index_path)
                .with_context(|| format!("Failed to read cache index: {}", index_path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse cache index")?
        } else {
            CacheIndex::default()
        };

        Ok(Self {
            root,
            version,
            entry_point: entry_point.into(),
            fetcher,
            index: Mutex::new(index),
            active: AtomicBool::new(false),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn version_dir(&self) -> PathBuf {
        self.root.join(&self.version)
    }

    /// Fetch every manifest resource and store the cacheable ones. Individual
    /// failures are logged and counted, never fatal: a partially populated
    /// cache still serves what it has and fills in lazily.
    pub async fn install(&self, manifest: &[String]) -> Result<InstallSummary> {
        info!(version = %self.version, resources = manifest.len(), "installing offline cache");

        let results: Vec<_> = stream::iter(manifest)
            .map(|url| async move { (url.as_str(), self.fetcher.fetch(url).await) })
            .buffer_unordered(MAX_INSTALL_CONCURRENCY)
            .collect()
            .await;

        let mut summary = InstallSummary::default();
        for (url, result) in results {
            match result {
                // The manifest is an explicit allow-list, so install stores
                // any successful response, cross-origin included. The
                // same-origin rule applies only to lazy serve-path caching.
                Ok(response) if response.is_success() => match self.store(url, &response) {
                    Ok(()) => summary.stored += 1,
                    Err(e) => {
                        warn!(%url, error = %e, "failed to store manifest resource");
                        summary.failed += 1;
                    }
                },
                Ok(response) => {
                    warn!(%url, status = response.status, "manifest resource returned an error");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(%url, error = %e, "failed to fetch manifest resource");
                    summary.failed += 1;
                }
            }
        }

        info!(stored = summary.stored, failed = summary.failed, "offline cache installed");
        Ok(summary)
    }

    /// Delete every other version directory and mark this cache live. The
    /// version bump plus this sweep is the cache's only eviction mechanism.
    pub fn activate(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache root: {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy() != self.version {
                info!(stale = %entry.file_name().to_string_lossy(), "removing stale cache version");
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    warn!(error = %e, "failed to remove stale cache version");
                }
            }
        }
        self.active.store(true, Ordering::SeqCst);
        info!(version = %self.version, "offline cache activated");
        Ok(())
    }

    /// Serve a resource, cache first.
    ///
    /// Cache hit: returned without touching the network. Miss: fetched, and
    /// stored when cacheable so the cache grows lazily beyond the manifest.
    /// Network failure: fall back to the cached entry point (the application
    /// shell) when present, otherwise propagate.
    pub async fn serve(&self, url: &str) -> Result<ResourceResponse, CacheError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(CacheError::NotActive);
        }

        if let Some(cached) = self.lookup(url) {
            debug!(%url, "cache hit");
            return Ok(cached);
        }

        match self.fetcher.fetch(url).await {
            Ok(response) => {
                if response.is_cacheable() {
                    if let Err(e) = self.store(url, &response) {
                        warn!(%url, error = %e, "failed to cache fetched resource");
                    }
                }
                Ok(response)
            }
            Err(e) => {
                if let Some(shell) = self.lookup(&self.entry_point) {
                    debug!(%url, error = %e, "network unavailable, serving entry point");
                    return Ok(shell);
                }
                Err(CacheError::Fetch(e))
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index
            .lock()
            .map(|index| index.entries.contains_key(url))
            .unwrap_or(false)
    }

    /// Version tags currently present under the cache root.
    pub fn versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache root: {}", self.root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn entry_paths(&self, stem: &str) -> (PathBuf, PathBuf) {
        let dir = self.version_dir();
        (dir.join(format!("{stem}.json")), dir.join(format!("{stem}.bin")))
    }

    fn lookup(&self, url: &str) -> Option<ResourceResponse> {
        let stem = {
            let index = self.index.lock().ok()?;
            index.entries.get(url).cloned()?
        };
        match self.read_entry(&stem) {
            Ok(response) => Some(response),
            Err(e) => {
                // A missing or corrupt entry degrades to a miss.
                warn!(%url, error = %e, "failed to read cache entry");
                None
            }
        }
    }

    fn read_entry(&self, stem: &str) -> Result<ResourceResponse> {
        let (meta_path, body_path) = self.entry_paths(stem);
        let contents = std::fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read entry metadata: {}", meta_path.display()))?;
        let meta: EntryMeta =
            serde_json::from_str(&contents).context("Failed to parse entry metadata")?;
        let body = std::fs::read(&body_path)
            .with_context(|| format!("Failed to read entry body: {}", body_path.display()))?;
        Ok(ResourceResponse {
            status: meta.status,
            origin: meta.origin,
            content_type: meta.content_type,
            body,
        })
    }

    /// Store a response under `url`, replacing any existing entry wholesale.
    fn store(&self, url: &str, response: &ResourceResponse) -> Result<()> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| anyhow::anyhow!("cache index lock poisoned"))?;

        let stem = match index.entries.get(url) {
            Some(stem) => stem.clone(),
            None => {
                let stem = format!("entry-{}", index.next_id);
                index.next_id += 1;
                stem
            }
        };

        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            origin: response.origin,
            content_type: response.content_type.clone(),
        };
        let (meta_path, body_path) = self.entry_paths(&stem);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Failed to write entry metadata: {}", meta_path.display()))?;
        std::fs::write(&body_path, &response.body)
            .with_context(|| format!("Failed to write entry body: {}", body_path.display()))?;

        index.entries.insert(url.to_string(), stem);
        let index_path = self.version_dir().join(INDEX_FILE);
        std::fs::write(&index_path, serde_json::to_string_pretty(&*index)?)
            .with_context(|| format!("Failed to write cache index: {}", index_path.display()))?;
        Ok(())
    }
}
