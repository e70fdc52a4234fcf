use crate::files::build_globset;
use beanscan_core::{uri_for_path, FileChangeKind, IndexEvent, Project, Result, ScanError, WatchConfig};
use globset::GlobSet;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedKind {
    Source,
    Output,
}

/// Classifies changed paths into source documents and build outputs.
#[derive(Debug, Clone)]
pub struct WatchPatterns {
    sources: GlobSet,
    outputs: GlobSet,
}

impl WatchPatterns {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        Ok(Self {
            sources: build_globset(
                &config
                    .source_patterns
                    .iter()
                    .chain(&config.factories_patterns)
                    .cloned()
                    .collect::<Vec<_>>(),
            )?,
            outputs: build_globset(&config.output_patterns)?,
        })
    }

    pub fn classify(&self, path: &Path) -> Option<WatchedKind> {
        if self.sources.is_match(path) {
            Some(WatchedKind::Source)
        } else if self.outputs.is_match(path) {
            Some(WatchedKind::Output)
        } else {
            None
        }
    }
}

fn change_kind(kind: &EventKind, path: &Path) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(if path.exists() {
            FileChangeKind::Created
        } else {
            FileChangeKind::Deleted
        }),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileChangeKind::Modified),
        _ => None,
    }
}

/// Forwards file system changes under project roots as [`IndexEvent::FileChanged`].
pub struct ProjectWatcher {
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl ProjectWatcher {
    pub fn new(patterns: WatchPatterns, events: mpsc::UnboundedSender<IndexEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in &event.paths {
                    if patterns.classify(path).is_none() {
                        continue;
                    }
                    let Some(kind) = change_kind(&event.kind, path) else {
                        continue;
                    };
                    let change = IndexEvent::FileChanged {
                        uri: uri_for_path(path),
                        kind,
                    };
                    if events.send(change).is_err() {
                        debug!("Event receiver dropped, ignoring file change");
                        return;
                    }
                }
            }
            Err(e) => error!(error = %e, "File watcher error"),
        })
        .map_err(|e| ScanError::Storage(format!("cannot create file watcher: {}", e)))?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// Watches the project location and any classpath directory outside of it.
    pub fn watch_project(&self, project: &Project) -> Result<()> {
        let mut roots = vec![project.location.clone()];
        roots.extend(
            project
                .classpath
                .iter()
                .map(|entry| entry.path.clone())
                .filter(|path| path.is_dir() && !path.starts_with(&project.location)),
        );

        let mut watcher = self.watcher.lock();
        let mut watched = self.watched.lock();
        for root in roots {
            if watched.contains(&root) {
                continue;
            }
            if !root.exists() {
                warn!(project = %project.name, root = %root.display(), "Cannot watch missing directory");
                continue;
            }
            watcher
                .watch(&root, RecursiveMode::Recursive)
                .map_err(|e| ScanError::Storage(format!("cannot watch {}: {}", root.display(), e)))?;
            info!(project = %project.name, root = %root.display(), "Watching");
            watched.insert(root);
        }
        Ok(())
    }

    pub fn unwatch_project(&self, project: &Project) {
        let mut watcher = self.watcher.lock();
        let mut watched = self.watched.lock();
        let roots: Vec<PathBuf> = watched
            .iter()
            .filter(|root| {
                root.starts_with(&project.location)
                    || project.classpath.iter().any(|entry| &entry.path == *root)
            })
            .cloned()
            .collect();
        for root in roots {
            if let Err(e) = watcher.unwatch(&root) {
                debug!(root = %root.display(), error = %e, "Unwatch failed");
            }
            watched.remove(&root);
        }
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.watched.lock().iter().cloned().collect();
        roots.sort();
        roots
    }
}
