//! The development harness.
//!
//! [`Harness`] ties the pieces together: it is the [`Listener`] that the
//! coordinator refreshes, it owns the supervised app process, and
//! [`Harness::run`] drives the proxy (or a timer) until shutdown.

mod error_page;
mod proxy;

pub use error_page::ErrorPage;
pub use proxy::DevProxy;

use crate::builder::{is_generated, Builder, CommandBuilder, SourceInfoProvider};
use crate::config::HarnessConfig;
use crate::coordinator::RebuildCoordinator;
use crate::error::{HarnessError, ProcessError, Result};
use crate::source_error::SourceError;
use crate::supervisor::AppProcess;
use crate::ui;
use crate::watcher::{Listener, WatchFilter};
use async_trait::async_trait;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// Find a free TCP port on localhost.
pub fn find_available_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Decides which directories and files the harness watches.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    ignore_dirs: Vec<String>,
    extensions: Vec<String>,
    tmp_dir: PathBuf,
}

impl SourceFilter {
    pub fn new(ignore_dirs: Vec<String>, extensions: Vec<String>, tmp_dir: PathBuf) -> Self {
        Self {
            ignore_dirs,
            extensions,
            tmp_dir,
        }
    }

    fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.watch.ignore_dirs.clone(),
            config.watch.source_extensions.clone(),
            config.resolved_tmp_dir(),
        )
    }
}

impl WatchFilter for SourceFilter {
    fn watch_dir(&self, dir: &Path) -> bool {
        if is_generated(dir, &self.tmp_dir) {
            return false;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        !self.ignore_dirs.iter().any(|ignored| ignored == name)
    }

    fn watch_file(&self, path: &Path) -> bool {
        if is_generated(path, &self.tmp_dir) {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// Rebuilds the app on change and keeps one instance of it running.
pub struct Harness {
    config: HarnessConfig,
    app_port: u16,
    code_paths: Vec<PathBuf>,
    filter: SourceFilter,
    provider: Arc<dyn SourceInfoProvider>,
    builder: Arc<dyn Builder>,
    /// Held for the whole refresh; only one rebuild touches the app at a time
    app: Mutex<Option<AppProcess>>,
    fatal_tx: mpsc::UnboundedSender<HarnessError>,
    fatal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<HarnessError>>>,
}

impl Harness {
    /// Create a harness with explicit build collaborators.
    ///
    /// With the proxy enabled the app gets `proxy.appPort`, or a free port
    /// when that is 0. Without the proxy the app listens on the proxy
    /// address's port itself.
    pub fn new(
        config: HarnessConfig,
        provider: Arc<dyn SourceInfoProvider>,
        builder: Arc<dyn Builder>,
    ) -> Result<Self> {
        config.validate()?;

        let app_port = if !config.proxy.enabled {
            config.proxy.addr.port()
        } else if config.proxy.app_port == 0 {
            find_available_port()?
        } else {
            config.proxy.app_port
        };

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            code_paths: config.resolved_code_paths(),
            filter: SourceFilter::from_config(&config),
            config,
            app_port,
            provider,
            builder,
            app: Mutex::new(None),
            fatal_tx,
            fatal_rx: parking_lot::Mutex::new(Some(fatal_rx)),
        })
    }

    /// Create a harness that builds with the configured `build.command`.
    pub fn with_command_builder(
        config: HarnessConfig,
        provider: Arc<dyn SourceInfoProvider>,
    ) -> Result<Self> {
        let builder = CommandBuilder::new(
            config.build.command.clone(),
            config.build.args.clone(),
            config.app_root.clone(),
            config.build.binary.clone(),
        )
        .with_tmp_dir(config.resolved_tmp_dir())
        .with_error_link(config.error_link.clone());
        Self::new(config, provider, Arc::new(builder))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Port the app is started on.
    pub fn app_port(&self) -> u16 {
        self.app_port
    }

    pub fn code_paths(&self) -> &[PathBuf] {
        &self.code_paths
    }

    /// Pid of the running app, if any.
    pub async fn app_pid(&self) -> Option<u32> {
        self.app
            .lock()
            .await
            .as_ref()
            .filter(|app| app.is_running())
            .and_then(AppProcess::pid)
    }

    /// Kill the running app, if any.
    pub async fn stop_app(&self) -> std::result::Result<(), ProcessError> {
        match self.app.lock().await.as_mut() {
            Some(app) => app.kill().await,
            None => Ok(()),
        }
    }

    /// Watch, rebuild and serve until Ctrl+C or a fatal error.
    ///
    /// With watching disabled the app is built once and run in the
    /// foreground instead.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if !self.config.watch.enabled {
            return self.run_live().await;
        }

        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .take()
            .ok_or_else(|| HarnessError::Custom("Harness is already running".to_string()))?;

        let coordinator = Arc::new(RebuildCoordinator::new(self.config.coordinator_options()));
        coordinator.listen(Arc::clone(&self) as Arc<dyn Listener>, &self.code_paths)?;
        ui::info(&format!(
            "Watching {} directories for changes",
            coordinator.watched_paths().len()
        ));

        let mut server = if self.config.proxy.enabled {
            let proxy = DevProxy::new(Arc::clone(&coordinator), self.app_port)?;
            let addr = self.config.proxy.addr;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| HarnessError::Server(format!("Failed to bind to {}: {}", addr, e)))?;
            ui::success(&format!("Listening on http://{}", addr));
            tokio::spawn(proxy.serve_on(listener))
        } else {
            tokio::spawn(poll_changes(Arc::clone(&coordinator)))
        };

        // Build before the first request arrives
        if let Err(err) = coordinator.notify().await {
            ui::error(&format!("Initial build failed: {}", err));
        }

        ui::info("Press Ctrl+C to stop");

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                ui::info("Shutting down...");
                Ok(())
            }
            res = &mut server => match res {
                Ok(Ok(())) => {
                    ui::warning("Server task completed unexpectedly");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(HarnessError::Server(format!("Server task failed: {}", e))),
            },
            Some(err) = fatal_rx.recv() => Err(err),
        };

        server.abort();
        coordinator.shutdown();
        if let Err(e) = self.stop_app().await {
            tracing::error!(error = %e, "Failed to stop app during shutdown");
        }

        outcome
    }

    /// Build once and run the app in the foreground until it exits.
    async fn run_live(&self) -> Result<()> {
        let binary = self.build().await.map_err(|e| HarnessError::Custom(e.to_string()))?;
        let command = self.config.app_command(binary, self.app_port);
        let mut app = AppProcess::new(command);

        tokio::select! {
            status = app.run() => {
                let status = status?;
                tracing::info!(%status, "App exited");
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                ui::info("Shutting down...");
                Ok(())
            }
        }
    }

    async fn build(&self) -> std::result::Result<PathBuf, SourceError> {
        let start = Instant::now();
        let info = self.provider.source_info(&self.code_paths).await?;
        let binary = self.builder.build(&info).await?;
        ui::success(&format!("Rebuilt in {}", ui::format_duration(start.elapsed())));
        Ok(binary)
    }

    fn fatal(&self, err: ProcessError) -> SourceError {
        let desc = err.to_string();
        tracing::error!(error = %desc, "Unrecoverable app process failure");
        let _ = self.fatal_tx.send(HarnessError::Fatal(desc.clone()));
        SourceError::new("", "App could not be stopped", "", desc)
    }
}

#[async_trait]
impl Listener for Harness {
    async fn refresh(&self) -> std::result::Result<(), SourceError> {
        let mut app = self.app.lock().await;

        if let Some(running) = app.as_mut() {
            if let Err(e) = running.kill().await {
                return Err(self.fatal(e));
            }
        }

        let binary = match self.build().await {
            Ok(binary) => binary,
            Err(err) => {
                ui::error(&err.to_string());
                return Err(err);
            }
        };

        let mut process = AppProcess::new(self.config.app_command(binary, self.app_port));
        let started = process.start(self.config.startup_timeout()).await;
        *app = Some(process);

        match started {
            Ok(()) => {
                ui::success(&format!("App ready on port {}", self.app_port));
                Ok(())
            }
            Err(e @ ProcessError::KillFailed { .. }) => Err(self.fatal(e)),
            Err(e) => {
                ui::error(&format!("App failed to start up: {}", e));
                Err(SourceError::startup(e))
            }
        }
    }

    fn watch_filter(&self) -> Option<&dyn WatchFilter> {
        Some(&self.filter)
    }
}

/// Without a proxy nothing pulls changes, so check on a timer.
async fn poll_changes(coordinator: Arc<RebuildCoordinator>) -> Result<()> {
    let mut ticker = tokio::time::interval(coordinator.options().refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = coordinator.notify().await {
            tracing::debug!(error = %err, "Rebuild failed, retrying on next change");
        }
    }
}
