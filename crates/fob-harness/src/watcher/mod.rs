//! Filesystem change notification for rebuild listeners.
//!
//! A [`Listener`] is anything that can rebuild itself. Listeners that want to
//! be selective about what they watch expose a [`WatchFilter`]; listeners
//! without one see every directory and every file.
//!
//! [`ChangeWatcher`] registers a set of roots with the `notify` backend and
//! hands back a stream of [`ChangeEvent`]s for the coordinator to consume.

mod registration;

pub use registration::ChangeWatcher;

use crate::source_error::SourceError;
use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind};
use std::path::{Path, PathBuf};

/// Receiver of filesystem change notifications.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Rebuild in response to relevant changes.
    ///
    /// A returned error is served to the user on the current request.
    async fn refresh(&self) -> Result<(), SourceError>;

    /// Optional capability to watch selectively.
    ///
    /// `None` accepts every directory and file.
    fn watch_filter(&self) -> Option<&dyn WatchFilter> {
        None
    }
}

/// Selective watching capability of a [`Listener`].
pub trait WatchFilter: Send + Sync {
    /// Whether to descend into (and watch) `dir`. Rejecting a directory
    /// excludes its whole subtree.
    fn watch_dir(&self, dir: &Path) -> bool;

    /// Whether a change to `path` should trigger a rebuild.
    fn watch_file(&self, path: &Path) -> bool;
}

/// A root passed to `listen`, as resolved at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedRoot {
    pub path: PathBuf,
    pub is_symlink: bool,
    /// Real path after symlink resolution (same as `path` otherwise)
    pub resolved_path: PathBuf,
}

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    Rename,
    /// Permissions or timestamps only
    Metadata,
    Other,
}

impl ChangeKind {
    /// Map a `notify` event kind. Access events carry no change and map to `None`.
    pub fn from_event_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Create(_) => Some(Self::Create),
            EventKind::Modify(ModifyKind::Metadata(_)) => Some(Self::Metadata),
            EventKind::Modify(ModifyKind::Name(_)) => Some(Self::Rename),
            EventKind::Modify(_) => Some(Self::Modify),
            EventKind::Remove(_) => Some(Self::Remove),
            EventKind::Any | EventKind::Other => Some(Self::Other),
        }
    }
}

/// A single filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Whether a change should trigger a rebuild for a listener with `filter`.
///
/// Dot-files never do. A filtering listener additionally ignores files it
/// rejects and metadata-only changes.
pub fn is_relevant(event: &ChangeEvent, filter: Option<&dyn WatchFilter>) -> bool {
    let hidden = event
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'));
    if hidden {
        return false;
    }

    match filter {
        Some(filter) => event.kind != ChangeKind::Metadata && filter.watch_file(&event.path),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RenameMode};

    struct RustOnly;

    impl WatchFilter for RustOnly {
        fn watch_dir(&self, dir: &Path) -> bool {
            dir.file_name().is_none_or(|name| name != "tmp")
        }

        fn watch_file(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "rs")
        }
    }

    #[test]
    fn test_dotfiles_are_never_relevant() {
        let event = ChangeEvent::new("/app/src/.main.rs.swp", ChangeKind::Modify);
        assert!(!is_relevant(&event, None));
        assert!(!is_relevant(&event, Some(&RustOnly)));
    }

    #[test]
    fn test_without_filter_everything_is_relevant() {
        let event = ChangeEvent::new("/app/README.md", ChangeKind::Metadata);
        assert!(is_relevant(&event, None));
    }

    #[test]
    fn test_filter_rejects_files_and_metadata_changes() {
        let filter: &dyn WatchFilter = &RustOnly;
        assert!(is_relevant(
            &ChangeEvent::new("/app/src/main.rs", ChangeKind::Modify),
            Some(filter)
        ));
        assert!(!is_relevant(
            &ChangeEvent::new("/app/README.md", ChangeKind::Modify),
            Some(filter)
        ));
        assert!(!is_relevant(
            &ChangeEvent::new("/app/src/main.rs", ChangeKind::Metadata),
            Some(filter)
        ));
    }

    #[test]
    fn test_change_kind_mapping() {
        assert_eq!(
            ChangeKind::from_event_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Create)
        );
        assert_eq!(
            ChangeKind::from_event_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modify)
        );
        assert_eq!(
            ChangeKind::from_event_kind(&EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Permissions
            ))),
            Some(ChangeKind::Metadata)
        );
        assert_eq!(
            ChangeKind::from_event_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Rename)
        );
        assert_eq!(
            ChangeKind::from_event_kind(&EventKind::Access(AccessKind::Any)),
            None
        );
    }
}
