//! Incremental indexer.
//!
//! Keeps the [`ChunkStore`] consistent with the vault:
//!
//! | Trigger | Action |
//! |---------|--------|
//! | startup, empty store | [`Indexer::rebuild`] |
//! | exclusion rules change | [`Indexer::set_exclusions`] → rebuild |
//! | document modified | [`Indexer::update_document`] |
//! | document deleted | [`Indexer::remove_document`] |
//! | document renamed | remove old path, then update new path |
//! | mention of an unindexed file | [`Indexer::ensure`] |
//!
//! # Persistence
//!
//! The on-disk snapshot (`<state_dir>/index.json`) is a JSON array of
//! chunk records. A full rebuild writes it immediately; incremental
//! changes schedule a debounced write so a burst of edits produces one
//! disk write carrying the final state. A corrupt snapshot is treated as
//! an empty index and triggers a rebuild.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vault_assist_core::chunk::chunk_markdown;
use vault_assist_core::models::Chunk;
use vault_assist_core::store::ChunkStore;

use crate::config::IndexConfig;
use crate::vault::{normalize_path, Vault, VaultEvent};

/// File name of the index snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "index.json";

/// Summary of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub documents: usize,
    pub chunks: usize,
    pub skipped: usize,
}

/// Point-in-time view of the index.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub enabled: bool,
    pub documents: usize,
    pub chunks: usize,
    pub snapshot_path: PathBuf,
    pub last_saved: Option<DateTime<Utc>>,
    pub snapshot_writes: usize,
}

/// Owns the chunk store and keeps it in sync with the vault.
pub struct Indexer {
    vault: Arc<dyn Vault>,
    store: Arc<RwLock<ChunkStore>>,
    settings: RwLock<IndexConfig>,
    exclude_folders: RwLock<Vec<String>>,
    writer: Arc<SnapshotWriter>,
}

impl Indexer {
    pub fn new(
        vault: Arc<dyn Vault>,
        settings: IndexConfig,
        exclude_folders: Vec<String>,
        state_dir: &Path,
    ) -> Self {
        let store = Arc::new(RwLock::new(ChunkStore::new()));
        let writer = Arc::new(SnapshotWriter {
            path: state_dir.join(SNAPSHOT_FILE),
            debounce_ms: AtomicU64::new(settings.save_debounce_ms),
            store: store.clone(),
            pending: Mutex::new(None),
            last_hash: Mutex::new(None),
            last_saved: Mutex::new(None),
            writes: AtomicUsize::new(0),
        });
        Self {
            vault,
            store,
            settings: RwLock::new(settings),
            exclude_folders: RwLock::new(normalize_folders(exclude_folders)),
            writer,
        }
    }

    /// Shared read access to the chunk store.
    pub fn store(&self) -> RwLockReadGuard<'_, ChunkStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn store_mut(&self) -> RwLockWriteGuard<'_, ChunkStore> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> IndexConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings().enabled
    }

    /// Apply new index settings. Takes effect for subsequent operations.
    pub fn update_settings(&self, settings: IndexConfig) {
        self.writer.set_debounce(Duration::from_millis(settings.save_debounce_ms));
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Whether `path` lies under an excluded folder prefix.
    pub fn is_excluded(&self, path: &str) -> bool {
        let folders = self.exclude_folders.read().unwrap_or_else(|e| e.into_inner());
        folders
            .iter()
            .any(|f| path == f || path.starts_with(&format!("{}/", f)))
    }

    fn is_eligible(&self, path: &str) -> bool {
        self.vault.is_document(path) && !self.is_excluded(path)
    }

    /// Load the snapshot, falling back to a rebuild when the store ends up
    /// empty and indexing is enabled.
    pub async fn load_or_rebuild(&self) -> Result<()> {
        match self.writer.load() {
            Ok(Some(mut loaded)) => {
                loaded.prune(|file| self.is_eligible(file));
                info!(chunks = loaded.len(), "loaded index snapshot");
                *self.store_mut() = loaded;
            }
            Ok(None) => debug!("no index snapshot found"),
            Err(e) => warn!(error = %e, "index snapshot unreadable; treating as empty"),
        }

        if self.store().is_empty() && self.is_enabled() {
            self.rebuild().await?;
        }
        Ok(())
    }

    /// Re-chunk every eligible document and replace the store wholesale.
    ///
    /// Unreadable documents are skipped. The snapshot is written
    /// immediately afterwards.
    pub async fn rebuild(&self) -> Result<RebuildStats> {
        let chunk_size = self.settings().chunk_size;
        let docs = self.vault.list_documents()?;
        let mut stats = RebuildStats::default();
        let mut chunks = Vec::new();

        for doc in docs.iter().filter(|d| !self.is_excluded(&d.path)) {
            match self.vault.read(&doc.path).await {
                Ok(text) => {
                    let doc_chunks = chunk_markdown(&doc.path, &text, doc.modified, chunk_size);
                    stats.documents += 1;
                    stats.chunks += doc_chunks.len();
                    chunks.extend(doc_chunks);
                }
                Err(e) => {
                    warn!(path = %doc.path, error = %e, "skipping unreadable document");
                    stats.skipped += 1;
                }
            }
        }

        self.store_mut().replace_all(chunks);
        info!(
            documents = stats.documents,
            chunks = stats.chunks,
            skipped = stats.skipped,
            "index rebuilt"
        );
        self.writer.write_now()?;
        Ok(stats)
    }

    /// Re-chunk one document and splice its chunks into the store.
    ///
    /// Ineligible, excluded, or vanished paths have their chunks removed.
    pub async fn update_document(&self, path: &str) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let path = normalize_path(path)?;
        if !self.is_eligible(&path) {
            self.remove_document(&path);
            return Ok(());
        }

        let Some(meta) = self.vault.stat(&path).await? else {
            self.remove_document(&path);
            return Ok(());
        };

        let text = self.vault.read(&path).await?;
        let chunks = chunk_markdown(&path, &text, meta.modified, self.settings().chunk_size);
        debug!(path = %path, chunks = chunks.len(), "document re-indexed");
        self.store_mut().replace_file(&path, chunks);
        self.writer.schedule();
        Ok(())
    }

    /// Drop all chunks for a deleted document, or for every document
    /// under a deleted folder.
    pub fn remove_document(&self, path: &str) {
        let prefix = format!("{}/", path);
        let removed = {
            let mut store = self.store_mut();
            store.remove_file(path) + store.prune(|file| !file.starts_with(&prefix))
        };
        if removed > 0 {
            debug!(path = %path, removed, "document removed from index");
            self.writer.schedule();
        }
    }

    /// Move a document's chunks to its new path. Folder renames re-index
    /// every document under the new folder.
    pub async fn rename_document(&self, from: &str, to: &str) -> Result<()> {
        self.remove_document(from);
        if self.vault.is_document(to) {
            return self.update_document(to).await;
        }
        let prefix = format!("{}/", to);
        for doc in self.vault.list_documents()? {
            if doc.path.starts_with(&prefix) {
                self.update_document(&doc.path).await?;
            }
        }
        Ok(())
    }

    /// Apply one host change notification.
    pub async fn handle_event(&self, event: VaultEvent) -> Result<()> {
        match event {
            VaultEvent::Modified(path) => self.update_document(&path).await,
            VaultEvent::Deleted(path) => {
                self.remove_document(&path);
                Ok(())
            }
            VaultEvent::Renamed { from, to } => self.rename_document(&from, &to).await,
        }
    }

    /// Chunks for `path`, chunking on demand when the store lacks them.
    ///
    /// When indexing is enabled the fresh chunks are merged into the store.
    pub async fn ensure(&self, path: &str) -> Result<Vec<Chunk>> {
        let path = normalize_path(path)?;
        {
            let store = self.store();
            let existing: Vec<Chunk> = store.chunks_for(&path).into_iter().cloned().collect();
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let meta = self.vault.stat(&path).await?;
        let text = self
            .vault
            .read(&path)
            .await
            .with_context(|| format!("Failed to load {}", path))?;
        let modified = meta.map(|m| m.modified).unwrap_or(0);
        let settings = self.settings();
        let chunks = chunk_markdown(&path, &text, modified, settings.chunk_size);

        if settings.enabled && self.is_eligible(&path) && !chunks.is_empty() {
            if self.store_mut().merge_file(&path, chunks.clone()) {
                self.writer.schedule();
            }
        }
        Ok(chunks)
    }

    /// Replace the excluded-folder prefixes and rebuild.
    pub async fn set_exclusions(&self, folders: Vec<String>) -> Result<RebuildStats> {
        *self
            .exclude_folders
            .write()
            .unwrap_or_else(|e| e.into_inner()) = normalize_folders(folders);
        self.rebuild().await
    }

    /// Write any pending snapshot immediately (shutdown path).
    pub fn flush(&self) -> Result<()> {
        if self.writer.cancel_pending() {
            self.writer.write_now()?;
        }
        Ok(())
    }

    pub fn status(&self) -> IndexStatus {
        let store = self.store();
        IndexStatus {
            enabled: self.is_enabled(),
            documents: store.files().len(),
            chunks: store.len(),
            snapshot_path: self.writer.path.clone(),
            last_saved: *self.writer.last_saved.lock().unwrap_or_else(|e| e.into_inner()),
            snapshot_writes: self.writer.writes.load(Ordering::SeqCst),
        }
    }
}

fn normalize_folders(folders: Vec<String>) -> Vec<String> {
    folders
        .into_iter()
        .filter_map(|f| normalize_path(&f).ok())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Debounced JSON snapshot writer.
struct SnapshotWriter {
    path: PathBuf,
    debounce_ms: AtomicU64,
    store: Arc<RwLock<ChunkStore>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    last_hash: Mutex<Option<String>>,
    last_saved: Mutex<Option<DateTime<Utc>>>,
    writes: AtomicUsize,
}

impl SnapshotWriter {
    fn set_debounce(&self, debounce: Duration) {
        self.debounce_ms
            .store(debounce.as_millis() as u64, Ordering::SeqCst);
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.load(Ordering::SeqCst))
    }

    fn load(&self) -> Result<Option<ChunkStore>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        };
        let store = ChunkStore::from_snapshot(&json)
            .with_context(|| format!("Corrupt index snapshot: {}", self.path.display()))?;
        *self.last_hash.lock().unwrap_or_else(|e| e.into_inner()) = Some(hash(&json));
        Ok(Some(store))
    }

    /// Cancel any pending write and schedule a new one.
    fn schedule(self: &Arc<Self>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let writer = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(writer.debounce()).await;
            if let Err(e) = writer.write_now() {
                warn!(error = %e, "failed to persist index snapshot");
            }
        }));
    }

    /// Abort a scheduled write. Returns whether one was pending.
    fn cancel_pending(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                was_running
            }
            None => false,
        }
    }

    fn write_now(&self) -> Result<()> {
        let json = self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .to_snapshot()?;
        let digest = hash(&json);
        if self
            .last_hash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(digest.as_str())
        {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        // Only a snapshot that reached disk counts as written.
        *self.last_hash.lock().unwrap_or_else(|e| e.into_inner()) = Some(digest);
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.last_saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        debug!(path = %self.path.display(), "index snapshot written");
        Ok(())
    }
}

fn hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
