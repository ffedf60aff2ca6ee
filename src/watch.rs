//! Filesystem watcher feeding [`VaultEvent`]s to the indexer.
//!
//! notify delivers raw events on its own thread; they are forwarded over a
//! bounded channel and translated to vault-relative events here. Hidden
//! paths (including the state folder) are ignored.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::indexer::Indexer;
use crate::vault::VaultEvent;

const CHANNEL_CAPACITY: usize = 1024;

pub struct VaultWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
}

impl VaultWatcher {
    pub fn start(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve vault root {}", root.display()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )
        .context("watcher init failed")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        Ok(Self {
            root,
            _watcher: watcher,
            events: rx,
        })
    }

    /// Next batch of translated events; `None` once the watcher is gone.
    pub async fn next(&mut self) -> Option<Vec<VaultEvent>> {
        loop {
            match self.events.recv().await? {
                Ok(event) => {
                    let translated = translate(&event, &self.root);
                    if !translated.is_empty() {
                        return Some(translated);
                    }
                }
                Err(e) => warn!(error = %e, "watcher error"),
            }
        }
    }

    /// Apply events to `indexer` until cancelled.
    pub async fn run(mut self, indexer: Arc<Indexer>, cancel: CancellationToken) -> Result<()> {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.next() => batch,
            };
            let Some(batch) = batch else { break };
            for event in batch {
                debug!(?event, "vault change");
                if let Err(e) = indexer.handle_event(event).await {
                    warn!(error = %e, "failed to apply vault change");
                }
            }
        }
        indexer.flush()
    }
}

/// Map one notify event onto vault events, relative to `root`.
pub fn translate(event: &Event, root: &Path) -> Vec<VaultEvent> {
    let rel = |p: &PathBuf| relative_visible(root, p);
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            match (rel(&event.paths[0]), rel(&event.paths[1])) {
                (Some(from), Some(to)) => vec![VaultEvent::Renamed { from, to }],
                (Some(from), None) => vec![VaultEvent::Deleted(from)],
                (None, Some(to)) => vec![VaultEvent::Modified(to)],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(rel)
            .map(VaultEvent::Deleted)
            .collect(),
        // Platforms that cannot pair rename halves report each path once.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .iter()
            .flat_map(|p| {
                if p.exists() {
                    modified_under(root, p)
                } else {
                    rel(p).map(VaultEvent::Deleted).into_iter().collect()
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => event
            .paths
            .iter()
            .flat_map(|p| modified_under(root, p))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .filter_map(rel)
            .map(VaultEvent::Modified)
            .collect(),
        _ => Vec::new(),
    }
}

/// `Modified` for `path`, or for every visible file below it when a
/// folder appeared under a new name.
fn modified_under(root: &Path, path: &Path) -> Vec<VaultEvent> {
    let Some(rel) = relative_visible(root, path) else {
        return Vec::new();
    };
    if !path.is_dir() {
        return vec![VaultEvent::Modified(rel)];
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| relative_visible(root, entry.path()))
        .map(VaultEvent::Modified)
        .collect()
}

fn relative_visible(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        let Component::Normal(name) = component else {
            return None;
        };
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            return None;
        }
        parts.push(name.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn create_and_write_become_modified() {
        let root = Path::new("/vault");
        let created = event(EventKind::Create(CreateKind::File), &["/vault/a.md"]);
        assert_eq!(
            translate(&created, root),
            vec![VaultEvent::Modified("a.md".into())]
        );
        let written = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/vault/notes/b.md"],
        );
        assert_eq!(
            translate(&written, root),
            vec![VaultEvent::Modified("notes/b.md".into())]
        );
    }

    #[test]
    fn paired_rename_and_removal() {
        let root = Path::new("/vault");
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/vault/old.md", "/vault/new.md"],
        );
        assert_eq!(
            translate(&renamed, root),
            vec![VaultEvent::Renamed {
                from: "old.md".into(),
                to: "new.md".into()
            }]
        );
        let removed = event(EventKind::Remove(RemoveKind::File), &["/vault/gone.md"]);
        assert_eq!(
            translate(&removed, root),
            vec![VaultEvent::Deleted("gone.md".into())]
        );
    }

    #[test]
    fn rename_into_hidden_folder_is_a_delete() {
        let root = Path::new("/vault");
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/vault/a.md", "/vault/.trash/a.md"],
        );
        assert_eq!(
            translate(&renamed, root),
            vec![VaultEvent::Deleted("a.md".into())]
        );
    }

    #[test]
    fn unpaired_folder_rename_reindexes_its_documents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        let folder = root.join("Projects");
        std::fs::create_dir_all(folder.join("sub")).unwrap();
        std::fs::create_dir_all(folder.join(".trash")).unwrap();
        std::fs::write(folder.join("plan.md"), "# Plan").unwrap();
        std::fs::write(folder.join("sub/notes.md"), "# Notes").unwrap();
        std::fs::write(folder.join(".trash/old.md"), "# Old").unwrap();

        for mode in [RenameMode::Any, RenameMode::To] {
            let renamed = event(
                EventKind::Modify(ModifyKind::Name(mode)),
                &[folder.to_str().unwrap()],
            );
            let mut events = translate(&renamed, root);
            events.sort_by_key(|e| format!("{:?}", e));
            assert_eq!(
                events,
                vec![
                    VaultEvent::Modified("Projects/plan.md".into()),
                    VaultEvent::Modified("Projects/sub/notes.md".into()),
                ]
            );
        }

        let gone = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
            &[root.join("Archive").to_str().unwrap()],
        );
        assert_eq!(
            translate(&gone, root),
            vec![VaultEvent::Deleted("Archive".into())]
        );
    }

    #[test]
    fn hidden_and_outside_paths_are_ignored() {
        let root = Path::new("/vault");
        let state = event(
            EventKind::Create(CreateKind::File),
            &["/vault/.vault-assist/index.json", "/elsewhere/x.md"],
        );
        assert!(translate(&state, root).is_empty());
    }
}
