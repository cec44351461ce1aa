//! Root registration with the `notify` backend.
//!
//! Directories are registered one by one (non-recursively) so that a subtree
//! rejected by the listener's filter never reaches the backend at all.

use super::{ChangeEvent, ChangeKind, WatchFilter, WatchedRoot};
use crate::error::WatchError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// A set of roots registered with one `notify` watcher.
///
/// Events are delivered through the receiver returned by
/// [`ChangeWatcher::register`]. Dropping the `ChangeWatcher` stops watching.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<WatchedRoot>,
    watched: Vec<PathBuf>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("roots", &self.roots)
            .field("watched", &self.watched.len())
            .finish_non_exhaustive()
    }
}

impl ChangeWatcher {
    /// Register `roots`, walking directories fully before returning.
    ///
    /// # Errors
    ///
    /// Any root that cannot be resolved, walked or watched is a configuration
    /// error. Registration stops at the first failure.
    pub fn register(
        roots: &[PathBuf],
        filter: Option<&dyn WatchFilter>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    // Receiver gone means the binding was shut down
                    let _ = tx.send(ChangeEvent { path, kind });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Watcher: notification error, event dropped");
            }
        })?;

        let mut resolved_roots = Vec::with_capacity(roots.len());
        let mut watched = Vec::new();

        for root in roots {
            let watched_root = resolve_root(root)?;
            let target = watched_root.resolved_path.clone();

            let meta = fs::metadata(&target).map_err(|source| WatchError::Stat {
                path: target.clone(),
                source,
            })?;

            if meta.is_dir() {
                walk_and_watch(&mut watcher, &target, filter, &mut watched)?;
            } else {
                watch_path(&mut watcher, &target)?;
                watched.push(target);
            }

            resolved_roots.push(watched_root);
        }

        tracing::debug!(
            roots = resolved_roots.len(),
            watched = watched.len(),
            "Watcher: registration complete"
        );

        Ok((
            Self {
                _watcher: watcher,
                roots: resolved_roots,
                watched,
            },
            rx,
        ))
    }

    /// Roots as resolved at registration.
    pub fn roots(&self) -> &[WatchedRoot] {
        &self.roots
    }

    /// Every path registered with the backend.
    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Whether `path` itself was registered.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched.iter().any(|p| p == path)
    }
}

fn resolve_root(root: &Path) -> Result<WatchedRoot, WatchError> {
    let stat_err = |source| WatchError::Stat {
        path: root.to_path_buf(),
        source,
    };

    let is_symlink = fs::symlink_metadata(root)
        .map_err(stat_err)?
        .file_type()
        .is_symlink();

    let resolved_path = if is_symlink {
        fs::canonicalize(root).map_err(stat_err)?
    } else {
        root.to_path_buf()
    };

    Ok(WatchedRoot {
        path: root.to_path_buf(),
        is_symlink,
        resolved_path,
    })
}

fn walk_and_watch(
    watcher: &mut RecommendedWatcher,
    root: &Path,
    filter: Option<&dyn WatchFilter>,
    watched: &mut Vec<PathBuf>,
) -> Result<(), WatchError> {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            !entry.file_type().is_dir() || filter.is_none_or(|f| f.watch_dir(entry.path()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // A symlink pointing back up the tree: already covered by its ancestor
            Err(e) if e.loop_ancestor().is_some() => {
                tracing::debug!(error = %e, "Watcher: skipping symlink loop");
                continue;
            }
            Err(source) => {
                return Err(WatchError::Walk {
                    path: root.to_path_buf(),
                    source,
                });
            }
        };

        if entry.file_type().is_dir() {
            watch_path(watcher, entry.path())?;
            watched.push(entry.path().to_path_buf());
        }
    }

    Ok(())
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<(), WatchError> {
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|source| WatchError::Register {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct SkipTmp;

    impl WatchFilter for SkipTmp {
        fn watch_dir(&self, dir: &Path) -> bool {
            dir.file_name().is_none_or(|name| name != "tmp")
        }

        fn watch_file(&self, _path: &Path) -> bool {
            true
        }
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app/controllers")).unwrap();
        fs::create_dir_all(dir.path().join("app/tmp/generated")).unwrap();
        fs::write(dir.path().join("app/controllers/app.rs"), "// app").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_register_walks_all_directories() {
        let dir = project();
        let root = dir.path().join("app");

        let (watcher, _rx) = ChangeWatcher::register(&[root.clone()], None).unwrap();

        assert!(watcher.is_watching(&root));
        assert!(watcher.is_watching(&root.join("controllers")));
        assert!(watcher.is_watching(&root.join("tmp/generated")));
        assert_eq!(watcher.roots().len(), 1);
        assert!(!watcher.roots()[0].is_symlink);
    }

    #[tokio::test]
    async fn test_rejected_directory_prunes_subtree() {
        let dir = project();
        let root = dir.path().join("app");

        let (watcher, _rx) = ChangeWatcher::register(&[root.clone()], Some(&SkipTmp)).unwrap();

        assert!(watcher.is_watching(&root.join("controllers")));
        assert!(
            watcher
                .watched_paths()
                .iter()
                .all(|p| !p.starts_with(root.join("tmp")))
        );
    }

    #[tokio::test]
    async fn test_single_file_root() {
        let dir = project();
        let file = dir.path().join("app/controllers/app.rs");

        let (watcher, _rx) = ChangeWatcher::register(&[file.clone()], None).unwrap();

        assert_eq!(watcher.watched_paths(), &[file]);
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        let err = ChangeWatcher::register(&[missing], None).unwrap_err();
        assert!(matches!(err, WatchError::Stat { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_root_is_resolved() {
        let dir = project();
        let link = dir.path().join("linked");
        std::os::unix::fs::symlink(dir.path().join("app"), &link).unwrap();

        let (watcher, _rx) = ChangeWatcher::register(&[link.clone()], None).unwrap();

        let root = &watcher.roots()[0];
        assert!(root.is_symlink);
        assert_eq!(root.path, link);
        assert_eq!(root.resolved_path, fs::canonicalize(dir.path().join("app")).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_cycle_terminates() {
        let dir = project();
        let root = dir.path().join("app");
        std::os::unix::fs::symlink(&root, root.join("controllers/loop")).unwrap();

        let (watcher, _rx) = ChangeWatcher::register(&[root.clone()], None).unwrap();
        assert!(watcher.is_watching(&root.join("controllers")));
    }
}
