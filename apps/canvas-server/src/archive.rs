//! Durable archives of the canvas, written once per cycle.
//!
//! Backends are tried in priority order. Writes stop at the first backend that accepts
//! the archive; reads take the first backend that has an answer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use canvas_core::{CanvasState, Color};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive_fs::FileArchiveBackend;
use crate::archive_object::ObjectStoreArchiveBackend;
use crate::archive_postgres::PostgresArchiveBackend;
use crate::config::AppConfig;
use crate::metrics::ARCHIVE_PERSIST;

const ID_PREFIX: &str = "canvas-";

/// Index entry for one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub id: String,
    /// Creation time, milliseconds since the unix epoch.
    pub timestamp: u64,
}

impl ArchiveMeta {
    pub fn at(timestamp: u64) -> Self {
        Self {
            id: format!("{ID_PREFIX}{timestamp}"),
            timestamp,
        }
    }

    /// Recover the entry from an id. Returns `None` for anything that is not an id this
    /// service generated, which also keeps ids safe to use as file and object names.
    pub fn from_id(id: &str) -> Option<Self> {
        let digits = id.strip_prefix(ID_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Self::at).filter(|meta| meta.id == id)
    }
}

/// Self-describing archive body as stored by the file and object backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: String,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub colors: Vec<Vec<Color>>,
}

impl ArchiveRecord {
    pub fn new(meta: &ArchiveMeta, state: &CanvasState) -> Self {
        Self {
            id: meta.id.clone(),
            timestamp: meta.timestamp,
            width: state.width,
            height: state.height,
            colors: state.colors.clone(),
        }
    }

    pub fn meta(&self) -> ArchiveMeta {
        ArchiveMeta {
            id: self.id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn into_state(self) -> CanvasState {
        CanvasState {
            colors: self.colors,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{backend} archive backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    #[error("no archive backend accepted the snapshot")]
    AllBackendsFailed,
    #[error("archive {0} already exists")]
    AlreadyExists(String),
}

impl ArchiveError {
    pub fn backend(backend: &'static str, err: impl std::fmt::Display) -> Self {
        ArchiveError::Backend {
            backend,
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store an archive. Writing the same id twice replaces the first write.
    async fn put(&self, meta: &ArchiveMeta, state: &CanvasState) -> Result<(), ArchiveError>;

    async fn get(&self, id: &str) -> Result<Option<CanvasState>, ArchiveError>;

    /// Every archive this backend holds, newest first.
    async fn list(&self) -> Result<Vec<ArchiveMeta>, ArchiveError>;
}

pub type ArchiveBackendHandle = Arc<dyn ArchiveBackend>;

/// Prioritized backends plus the in-memory, newest-first archive index.
pub struct ArchiveStore {
    backends: Vec<ArchiveBackendHandle>,
    index: RwLock<Vec<ArchiveMeta>>,
}

impl ArchiveStore {
    pub fn new(backends: Vec<ArchiveBackendHandle>) -> Self {
        Self {
            backends,
            index: RwLock::new(Vec::new()),
        }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Entry for a new archive taken at `now_ms`. The timestamp moves past the newest
    /// indexed archive so two firings in the same millisecond get distinct ids.
    pub fn next_meta(&self, now_ms: u64) -> ArchiveMeta {
        let floor = self
            .index
            .read()
            .iter()
            .map(|m| m.timestamp.saturating_add(1))
            .max()
            .unwrap_or(0);
        ArchiveMeta::at(now_ms.max(floor))
    }

    /// Write to the first backend that accepts the archive and record it in the index.
    /// Returns the name of the backend that took it. Archives are never overwritten: an
    /// id already in the index is refused before any backend sees it.
    pub async fn persist(
        &self,
        meta: &ArchiveMeta,
        state: &CanvasState,
    ) -> Result<&'static str, ArchiveError> {
        if self.index.read().iter().any(|m| m.id == meta.id) {
            return Err(ArchiveError::AlreadyExists(meta.id.clone()));
        }
        for backend in &self.backends {
            match backend.put(meta, state).await {
                Ok(()) => {
                    ARCHIVE_PERSIST
                        .with_label_values(&[backend.name(), "ok"])
                        .inc();
                    self.index.write().insert(0, meta.clone());
                    info!(archive_id = %meta.id, backend = backend.name(), "archive persisted");
                    return Ok(backend.name());
                }
                Err(err) => {
                    ARCHIVE_PERSIST
                        .with_label_values(&[backend.name(), "error"])
                        .inc();
                    warn!(
                        archive_id = %meta.id,
                        backend = backend.name(),
                        error = %err,
                        "archive backend rejected snapshot; trying next"
                    );
                }
            }
        }
        Err(ArchiveError::AllBackendsFailed)
    }

    /// Adopt the full listing of the first backend that has any archives. Listings are
    /// never merged across backends. Returns the number of archives indexed.
    pub async fn load_index(&self) -> usize {
        for backend in &self.backends {
            match backend.list().await {
                Ok(mut listing) if !listing.is_empty() => {
                    listing.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                    let count = listing.len();
                    *self.index.write() = listing;
                    info!(backend = backend.name(), count, "archive index loaded");
                    return count;
                }
                Ok(_) => debug!(backend = backend.name(), "archive backend is empty"),
                Err(err) => warn!(
                    backend = backend.name(),
                    error = %err,
                    "failed to list archives; trying next backend"
                ),
            }
        }
        0
    }

    /// First non-empty answer in priority order.
    pub async fn fetch(&self, id: &str) -> Option<CanvasState> {
        ArchiveMeta::from_id(id)?;
        for backend in &self.backends {
            match backend.get(id).await {
                Ok(Some(state)) => return Some(state),
                Ok(None) => {}
                Err(err) => warn!(
                    archive_id = %id,
                    backend = backend.name(),
                    error = %err,
                    "failed to read archive; trying next backend"
                ),
            }
        }
        None
    }

    pub fn list(&self) -> Vec<ArchiveMeta> {
        self.index.read().clone()
    }
}

/// Assemble the configured backends in priority order: database, object storage, local
/// directory. Unreachable backends are skipped with a warning.
pub async fn build_archive_store(cfg: &AppConfig) -> ArchiveStore {
    let mut backends: Vec<ArchiveBackendHandle> = Vec::new();
    if let Some(url) = cfg.database_url.as_deref() {
        match PostgresArchiveBackend::connect(url).await {
            Ok(pg) => backends.push(Arc::new(pg)),
            Err(err) => warn!(error = %err, "DATABASE_URL set but postgres archive unavailable"),
        }
    }
    if let Some(url) = cfg.object_store_url.as_deref() {
        match ObjectStoreArchiveBackend::new(
            url,
            &cfg.object_store_prefix,
            cfg.object_store_token.clone(),
        ) {
            Ok(store) => backends.push(Arc::new(store)),
            Err(err) => warn!(error = %err, "OBJECT_STORE_URL set but client failed to build"),
        }
    }
    if let Some(dir) = cfg.archive_dir.as_ref() {
        backends.push(Arc::new(FileArchiveBackend::new(dir.clone())));
    }
    if backends.is_empty() {
        warn!("no archive backend configured; snapshots will not be persisted");
    }
    ArchiveStore::new(backends)
}

/// Process-local backend for tests and throwaway runs. Can be told to fail.
pub struct InMemoryArchiveBackend {
    name: &'static str,
    archives: Mutex<Vec<ArchiveRecord>>,
    failing: AtomicBool,
    put_attempts: AtomicU64,
}

impl InMemoryArchiveBackend {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            archives: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            put_attempts: AtomicU64::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Every `put` call, including the ones that failed.
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.archives.lock().await.len()
    }

    fn check(&self) -> Result<(), ArchiveError> {
        if self.failing.load(Ordering::Relaxed) {
            Err(ArchiveError::backend(self.name, "unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ArchiveBackend for InMemoryArchiveBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn put(&self, meta: &ArchiveMeta, state: &CanvasState) -> Result<(), ArchiveError> {
        self.put_attempts.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        let mut archives = self.archives.lock().await;
        archives.retain(|a| a.id != meta.id);
        archives.push(ArchiveRecord::new(meta, state));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanvasState>, ArchiveError> {
        self.check()?;
        Ok(self
            .archives
            .lock()
            .await
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .map(ArchiveRecord::into_state))
    }

    async fn list(&self) -> Result<Vec<ArchiveMeta>, ArchiveError> {
        self.check()?;
        let mut listing: Vec<ArchiveMeta> = self
            .archives
            .lock()
            .await
            .iter()
            .map(ArchiveRecord::meta)
            .collect();
        listing.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(listing)
    }
}
