//! Rebuild scheduling across watcher/listener bindings.
//!
//! The coordinator decides when a listener has to rebuild and makes sure
//! rebuilds never overlap:
//!
//! - **Pull** ([`RebuildCoordinator::notify`]): drain pending events of every
//!   binding and rebuild when something relevant changed, when the previous
//!   rebuild failed, or on the very first call.
//! - **Eager**: a background task per binding requests a rebuild as soon as a
//!   relevant event arrives.
//!
//! Both go through the same dispatch policy. `Debounced` coalesces requests
//! through one shared window; `Serial` runs refreshes inline under one lock.

mod debounce;

use crate::error::WatchError;
use crate::source_error::SourceError;
use crate::watcher::{is_relevant, ChangeEvent, ChangeWatcher, Listener};
use debounce::Debouncer;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Outcome of a rebuild. Every participant of one debounce window receives a
/// clone of the same `Arc`.
pub type RefreshResult = Result<(), Arc<SourceError>>;

/// How change events reach the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Events are buffered until the next `notify()`
    #[default]
    Normal,
    /// Events trigger rebuilds in the background as they arrive
    Eager,
}

/// How rebuild requests are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Coalesce requests through a shared debounce window
    #[default]
    Debounced,
    /// Refresh inline, one at a time under a lock
    Serial,
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub watch_mode: WatchMode,
    pub dispatch: DispatchMode,
    /// Debounce window length
    pub refresh_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            watch_mode: WatchMode::Normal,
            dispatch: DispatchMode::Debounced,
            refresh_interval: Duration::from_millis(1000),
        }
    }
}

struct ListenerBinding {
    listener: Arc<dyn Listener>,
    watcher: ChangeWatcher,
    /// Pull-mode event buffer; `None` when an eager task owns the stream
    events: Option<parking_lot::Mutex<mpsc::UnboundedReceiver<ChangeEvent>>>,
}

impl ListenerBinding {
    /// Drain pending events without blocking. True if any was relevant.
    fn drain(&self) -> bool {
        let Some(events) = &self.events else {
            return false;
        };

        let filter = self.listener.watch_filter();
        let mut events = events.lock();
        let mut refresh = false;
        while let Ok(event) = events.try_recv() {
            if is_relevant(&event, filter) {
                tracing::debug!(path = %event.path.display(), kind = ?event.kind, "Watcher: relevant change");
                refresh = true;
            }
        }
        refresh
    }
}

/// Schedules rebuilds for registered listeners.
pub struct RebuildCoordinator {
    options: CoordinatorOptions,
    bindings: RwLock<Vec<Arc<ListenerBinding>>>,
    debouncer: Debouncer,
    serial: Arc<Mutex<()>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RebuildCoordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        Self {
            debouncer: Debouncer::new(options.refresh_interval),
            options,
            bindings: RwLock::new(Vec::new()),
            serial: Arc::new(Mutex::new(())),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Register `listener` for changes under `roots`.
    ///
    /// All roots are walked and registered before this returns. In eager mode
    /// a background task is spawned, so this must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// An unwatchable or missing root is a configuration error.
    pub fn listen(&self, listener: Arc<dyn Listener>, roots: &[PathBuf]) -> Result<(), WatchError> {
        let (watcher, rx) = ChangeWatcher::register(roots, listener.watch_filter())?;

        tracing::info!(
            roots = ?roots,
            directories = watcher.watched_paths().len(),
            mode = ?self.options.watch_mode,
            "Watcher: listening"
        );

        let events = match self.options.watch_mode {
            WatchMode::Normal => Some(parking_lot::Mutex::new(rx)),
            WatchMode::Eager => {
                let handle = tokio::spawn(eager_loop(
                    Arc::clone(&listener),
                    rx,
                    self.options.dispatch,
                    self.debouncer.clone(),
                    Arc::clone(&self.serial),
                ));
                self.tasks.lock().push(handle);
                None
            }
        };

        self.bindings.write().push(Arc::new(ListenerBinding {
            listener,
            watcher,
            events,
        }));

        Ok(())
    }

    /// Forward pending changes to listeners, rebuilding where required.
    ///
    /// Returns the first error reported. The failing binding is remembered
    /// and rebuilt on the next call even if nothing changed.
    pub async fn notify(&self) -> RefreshResult {
        let _serial = match self.options.dispatch {
            DispatchMode::Serial => Some(self.serial.lock().await),
            DispatchMode::Debounced => None,
        };

        let bindings: Vec<_> = self.bindings.read().iter().cloned().collect();

        for (index, binding) in bindings.iter().enumerate() {
            let changed = binding.drain();

            let (force, failed_last, seen) = {
                let state = self.debouncer.state().lock().await;
                (state.force_refresh, state.last_error == Some(index), state.completed)
            };

            tracing::debug!(
                index,
                force,
                changed,
                failed_last,
                "Watcher: notify refresh state"
            );

            if !(force || changed || failed_last) {
                continue;
            }

            let (result, generation) = match self.options.dispatch {
                DispatchMode::Serial => (binding.listener.refresh().await.map_err(Arc::new), seen),
                DispatchMode::Debounced => {
                    let outcome = self
                        .debouncer
                        .request_tracked(Arc::clone(&binding.listener))
                        .await;
                    (outcome.result, outcome.generation)
                }
            };

            let mut state = self.debouncer.state().lock().await;
            if let Err(err) = result {
                state.last_error = Some(index);
                state.force_refresh = true;
                return Err(err);
            }

            // A window opened or finished after ours owns the flags now
            if state.is_latest(generation) {
                state.last_error = None;
                state.force_refresh = false;
            } else {
                tracing::debug!(index, "Watcher: newer rebuild pending, keeping refresh state");
            }
        }

        Ok(())
    }

    /// Request a debounced refresh of `listener` directly.
    pub async fn request_refresh(&self, listener: Arc<dyn Listener>) -> RefreshResult {
        self.debouncer.request(listener).await
    }

    /// Whether the next `notify()` rebuilds regardless of events.
    pub async fn force_refresh_pending(&self) -> bool {
        self.debouncer.state().lock().await.force_refresh
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.read().len()
    }

    /// Paths registered with the backend, across all bindings.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.bindings
            .read()
            .iter()
            .flat_map(|b| b.watcher.watched_paths().iter().cloned())
            .collect()
    }

    /// Stop eager tasks and drop every watcher.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.bindings.write().clear();
    }
}

impl Drop for RebuildCoordinator {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn eager_loop(
    listener: Arc<dyn Listener>,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    dispatch: DispatchMode,
    debouncer: Debouncer,
    serial: Arc<Mutex<()>>,
) {
    while let Some(event) = rx.recv().await {
        if !is_relevant(&event, listener.watch_filter()) {
            continue;
        }
        tracing::debug!(path = %event.path.display(), "Watcher: change detected, rebuilding");

        match dispatch {
            DispatchMode::Serial => {
                let _guard = serial.lock().await;
                if let Err(err) = listener.refresh().await {
                    tracing::error!(error = %err, "Watcher: listener refresh reported error");
                }
            }
            DispatchMode::Debounced => {
                let debouncer = debouncer.clone();
                let listener = Arc::clone(&listener);
                tokio::spawn(async move {
                    if let Err(err) = debouncer.request(listener).await {
                        tracing::error!(error = %err, "Watcher: failed to notify");
                    }
                });
            }
        }
    }
}
