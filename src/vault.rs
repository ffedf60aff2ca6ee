//! Document collaborator: the vault on disk.
//!
//! The [`Vault`] trait is everything the indexer and tools need from the
//! host document store: enumerate documents, read and write text, and
//! stat a path. [`FsVault`] implements it over a directory tree.
//!
//! All paths crossing this boundary are vault-relative with `/`
//! separators. [`FsVault`] refuses absolute paths, `..` escapes, and the
//! hidden state directory, so tools cannot reach outside the vault.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::VaultConfig;

/// Lightweight metadata for one file in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    /// Vault-relative path with `/` separators.
    pub path: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified: i64,
    pub size: u64,
}

/// A change notification from the host, delivered one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}

/// Host document store.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Markdown documents eligible for indexing, sorted by path.
    fn list_documents(&self) -> Result<Vec<DocumentMeta>>;

    /// Every file in the vault (any type), sorted by path.
    fn list_files(&self) -> Result<Vec<DocumentMeta>>;

    /// Whether `path` names a document type the indexer handles.
    fn is_document(&self, path: &str) -> bool;

    /// Metadata for one file, or `None` when it does not exist.
    async fn stat(&self, path: &str) -> Result<Option<DocumentMeta>>;

    /// Current text of a document.
    async fn read(&self, path: &str) -> Result<String>;

    /// Replace a document's text, creating parent folders as needed.
    async fn write(&self, path: &str, content: &str) -> Result<()>;
}

/// [`Vault`] backed by a directory on the local filesystem.
pub struct FsVault {
    root: PathBuf,
    state_dir: String,
    include: GlobSet,
    follow_symlinks: bool,
}

impl FsVault {
    pub fn new(config: &VaultConfig) -> Result<Self> {
        if !config.root.is_dir() {
            bail!("Vault root does not exist: {}", config.root.display());
        }
        Ok(Self {
            root: config.root.clone(),
            state_dir: config.state_dir.clone(),
            include: build_globset(&config.include_globs)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a vault-relative path to an absolute one, refusing escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = normalize_path(path)?;
        if rel.is_empty() {
            return Ok(self.root.clone());
        }
        if rel == self.state_dir || rel.starts_with(&format!("{}/", self.state_dir)) {
            bail!("path is reserved: {}", path);
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, documents_only: bool) -> Result<Vec<DocumentMeta>> {
        let mut out = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable vault entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(&self.root, entry.path()) else {
                continue;
            };
            if documents_only && !self.include.is_match(&rel) {
                continue;
            }
            let meta = entry.metadata()?;
            out.push(DocumentMeta {
                path: rel,
                modified: modified_millis(meta.modified().ok()),
                size: meta.len(),
            });
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

#[async_trait]
impl Vault for FsVault {
    fn list_documents(&self) -> Result<Vec<DocumentMeta>> {
        self.walk(true)
    }

    fn list_files(&self) -> Result<Vec<DocumentMeta>> {
        self.walk(false)
    }

    fn is_document(&self, path: &str) -> bool {
        self.include.is_match(path)
    }

    async fn stat(&self, path: &str) -> Result<Option<DocumentMeta>> {
        let abs = self.resolve(path)?;
        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_file() => Ok(Some(DocumentMeta {
                path: normalize_path(path)?,
                modified: modified_millis(meta.modified().ok()),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path)),
        }
    }

    async fn read(&self, path: &str) -> Result<String> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .with_context(|| format!("file not found: {}", path))?;
        if meta.is_dir() {
            bail!("path is a directory: {}", path);
        }
        tokio::fs::read_to_string(&abs)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let abs = self.resolve(path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create folder for {}", path))?;
        }
        tokio::fs::write(&abs, content)
            .await
            .with_context(|| format!("Failed to write {}", path))
    }
}

/// Canonicalize a vault-relative path: `/` separators, no `.` segments,
/// no leading or trailing slash. Rejects absolute paths and `..`.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(unified.trim_start_matches("./")).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => bail!("path escapes the vault: {}", path),
            Component::RootDir | Component::Prefix(_) => {
                bail!("absolute paths are not allowed: {}", path)
            }
        }
    }
    Ok(parts.join("/"))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

/// Convert a file modification time to epoch milliseconds (0 if unknown).
pub fn modified_millis(modified: Option<SystemTime>) -> i64 {
    modified
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
