//! Debounced, coalesced refresh requests.
//!
//! The first request while no window is open becomes the owner of a new
//! window. Requests arriving while the window is open join it and push its
//! deadline out. When the deadline passes, the window's refresh runs exactly
//! once under the state lock and its result goes to every participant.
//! Requests that arrive during the refresh wait on the lock, so the next
//! window only opens after the current result has been handed out.
//!
//! The window runs on its own task: a participant that stops waiting (e.g. a
//! disconnected HTTP client) never strands the others.

use super::RefreshResult;
use crate::source_error::SourceError;
use crate::watcher::Listener;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, Instant};

/// Coordinator state guarded by one lock.
#[derive(Debug)]
pub(crate) struct DebounceState {
    window: Option<Window>,
    /// Rebuild on the next check even without new events
    pub(crate) force_refresh: bool,
    /// Binding whose last refresh failed
    pub(crate) last_error: Option<usize>,
    /// Number of windows whose result has been dispatched
    pub(crate) completed: u64,
}

impl DebounceState {
    /// Whether the bookkeeping of window `generation` is still current:
    /// no later window has completed or is pending.
    pub(crate) fn is_latest(&self, generation: u64) -> bool {
        self.window.is_none() && self.completed == generation
    }
}

/// Result of one window, tagged with the window's generation.
#[derive(Debug, Clone)]
pub(crate) struct WindowOutcome {
    pub(crate) result: RefreshResult,
    pub(crate) generation: u64,
}

#[derive(Debug)]
struct Window {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<WindowOutcome>>,
}

/// Shared debounce primitive. Cloning shares the same state.
#[derive(Debug, Clone)]
pub(crate) struct Debouncer {
    interval: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(DebounceState {
                window: None,
                // Nothing has been built yet
                force_refresh: true,
                last_error: None,
                completed: 0,
            })),
        }
    }

    pub(crate) fn state(&self) -> &Mutex<DebounceState> {
        &self.state
    }

    /// Request a refresh of `listener` and wait for the window's result.
    pub(crate) async fn request(&self, listener: Arc<dyn Listener>) -> RefreshResult {
        self.request_tracked(listener).await.result
    }

    /// Like [`request`](Self::request), also reporting which window ran.
    pub(crate) async fn request_tracked(&self, listener: Arc<dyn Listener>) -> WindowOutcome {
        let (tx, rx) = oneshot::channel();

        let owner = {
            let mut state = self.state.lock().await;
            state.force_refresh = true;
            let deadline = Instant::now() + self.interval;
            match state.window.as_mut() {
                Some(window) => {
                    tracing::debug!(
                        waiters = window.waiters.len() + 1,
                        "Found existing refresh timer running, resetting"
                    );
                    window.deadline = deadline;
                    window.waiters.push(tx);
                    false
                }
                None => {
                    state.window = Some(Window {
                        deadline,
                        waiters: vec![tx],
                    });
                    true
                }
            }
        };

        if owner {
            tracing::debug!(interval = ?self.interval, "Waiting for refresh timer to expire");
            tokio::spawn(run_window(Arc::clone(&self.state), listener));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut state = self.state.lock().await;
                state.force_refresh = true;
                WindowOutcome {
                    result: Err(Arc::new(SourceError::new(
                        "",
                        "Rebuild aborted",
                        "",
                        "The rebuild ended without reporting a result",
                    ))),
                    generation: state.completed,
                }
            }
        }
    }
}

async fn run_window(state: Arc<Mutex<DebounceState>>, listener: Arc<dyn Listener>) {
    let mut guard = loop {
        let deadline = match state.lock().await.window.as_ref() {
            Some(window) => window.deadline,
            None => return,
        };

        sleep_until(deadline).await;

        let guard = state.lock().await;
        match guard.window.as_ref() {
            Some(window) if window.deadline <= Instant::now() => break guard,
            Some(_) => continue,
            None => return,
        }
    };

    let result: RefreshResult = match AssertUnwindSafe(listener.refresh()).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Arc::new(err)),
        Err(_) => Err(Arc::new(SourceError::new(
            "",
            "Rebuild panicked",
            "",
            "The listener panicked while rebuilding",
        ))),
    };

    match &result {
        Ok(()) => {
            guard.force_refresh = false;
            guard.last_error = None;
        }
        Err(err) => {
            tracing::info!(error = %err, "Recording error from last build, rebuild stays on");
            guard.force_refresh = true;
        }
    }

    guard.completed += 1;
    let outcome = WindowOutcome {
        result,
        generation: guard.completed,
    };

    // Dispatch before the lock is released
    if let Some(window) = guard.window.take() {
        tracing::info!(
            participants = window.waiters.len(),
            ok = outcome.result.is_ok(),
            generation = outcome.generation,
            "Rebuilt"
        );
        for waiter in window.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Listener for Failing {
        async fn refresh(&self) -> Result<(), SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(SourceError::new("", "Build", "", format!("failure #{}", n)))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Listener for Panicking {
        async fn refresh(&self) -> Result<(), SourceError> {
            panic!("boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_requests_open_new_windows() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let listener = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });

        let first = debouncer.request(listener.clone()).await.unwrap_err();
        let second = debouncer.request(listener.clone()).await.unwrap_err();

        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(debouncer.state().lock().await.force_refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_refresh_still_dispatches() {
        let debouncer = Debouncer::new(Duration::from_millis(10));

        let err = debouncer.request(Arc::new(Panicking)).await.unwrap_err();
        assert_eq!(err.title, "Rebuild panicked");

        // Window was closed, so the next request opens a new one
        let state = debouncer.state().lock().await;
        assert!(state.window.is_none());
        assert!(state.force_refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_counts_windows() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let listener = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });

        let first = debouncer.request_tracked(listener.clone()).await;
        let second = debouncer.request_tracked(listener).await;

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        let state = debouncer.state().lock().await;
        assert!(state.is_latest(2));
        assert!(!state.is_latest(1));
    }
}
