//! Supervision of the app server child process.
//!
//! [`AppProcess`] launches a built binary, waits for it to announce
//! readiness on stdout and kills it before the next rebuild. The OS handle
//! is kept behind a small state machine and never handed out.

mod sentinel;

pub use sentinel::{SentinelScanner, DEFAULT_READY_PATTERN};

use crate::error::ProcessError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

/// Default time an app gets to print its ready line.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters the app binary is launched with.
#[derive(Debug, Clone)]
pub struct AppCommand {
    pub binary_path: PathBuf,
    pub port: u16,
    pub import_path: String,
    /// Run mode string passed through to the app (e.g. `dev`)
    pub run_mode: String,
    pub ready_patterns: Vec<String>,
}

impl AppCommand {
    pub fn new(binary_path: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            binary_path: binary_path.into(),
            port,
            import_path: String::new(),
            run_mode: "dev".to_string(),
            ready_patterns: vec![DEFAULT_READY_PATTERN.to_string()],
        }
    }

    pub fn with_import_path(mut self, import_path: impl Into<String>) -> Self {
        self.import_path = import_path.into();
        self
    }

    pub fn with_run_mode(mut self, run_mode: impl Into<String>) -> Self {
        self.run_mode = run_mode.into();
        self
    }

    pub fn with_ready_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ready_patterns = patterns;
        self
    }

    /// Command line arguments, in the order the app expects them.
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("--port={}", self.port),
            format!("--import-path={}", self.import_path),
            format!("--run-mode={}", self.run_mode),
        ]
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Lifecycle of the supervised process.
#[derive(Debug, Default)]
enum ProcessState {
    #[default]
    NotStarted,
    Running(Child),
    Exited(ExitStatus),
}

/// Observable lifecycle state, without the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Exited(ExitStatus),
}

/// A supervised app server.
#[derive(Debug)]
pub struct AppProcess {
    command: AppCommand,
    state: ProcessState,
    pid: Option<u32>,
}

impl AppProcess {
    pub fn new(command: AppCommand) -> Self {
        Self {
            command,
            state: ProcessState::NotStarted,
            pid: None,
        }
    }

    pub fn binary_path(&self) -> &Path {
        &self.command.binary_path
    }

    pub fn port(&self) -> u16 {
        self.command.port
    }

    /// Pid of the most recently launched child.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        match &self.state {
            ProcessState::NotStarted => ProcessStatus::NotStarted,
            ProcessState::Running(_) => ProcessStatus::Running,
            ProcessState::Exited(status) => ProcessStatus::Exited(*status),
        }
    }

    /// Whether the app was started and has not been seen exiting.
    pub fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running(_))
    }

    /// Launch the app and wait until it is ready to serve requests.
    ///
    /// Resolves to exactly one of: ready, exited early, or timed out. On
    /// timeout the child is killed before returning.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::Exited`] if the app died before printing its ready line
    /// - [`ProcessError::StartupTimeout`] if `timeout` elapsed first
    /// - [`ProcessError::Spawn`] if the binary could not be launched
    pub async fn start(&mut self, timeout: Duration) -> Result<(), ProcessError> {
        // Never leave a previous instance behind
        self.kill().await?;

        let mut cmd = self.command.command();
        cmd.stdout(Stdio::piped());

        tracing::info!(
            path = %self.command.binary_path.display(),
            args = ?self.command.args(),
            "Exec app"
        );

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            binary: self.command.binary_path.clone(),
            source,
        })?;
        self.pid = child.id();

        let (ready_tx, mut ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            let scanner = SentinelScanner::new(&self.command.ready_patterns);
            tokio::spawn(sentinel::forward_output(
                stdout,
                tokio::io::stdout(),
                scanner,
                ready_tx,
            ));
        }

        enum Outcome {
            Ready,
            Exited(std::io::Result<ExitStatus>),
            TimedOut,
        }

        let outcome = tokio::select! {
            biased;
            Ok(()) = &mut ready_rx => Outcome::Ready,
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Ready => {
                tracing::debug!(pid = ?self.pid, "App is ready");
                self.state = ProcessState::Running(child);
                Ok(())
            }
            Outcome::Exited(Ok(status)) => {
                self.state = ProcessState::Exited(status);
                Err(ProcessError::Exited { status })
            }
            Outcome::Exited(Err(e)) => {
                self.state = ProcessState::Running(child);
                self.kill().await?;
                Err(ProcessError::Wait(e))
            }
            Outcome::TimedOut => {
                tracing::warn!(
                    pid = ?self.pid,
                    ?timeout,
                    "Killing app server process, it did not respond after wait timeout"
                );
                self.state = ProcessState::Running(child);
                self.kill().await?;
                Err(ProcessError::StartupTimeout { timeout })
            }
        }
    }

    /// Run the app in the foreground until it exits.
    pub async fn run(&mut self) -> Result<ExitStatus, ProcessError> {
        self.kill().await?;

        let mut cmd = self.command.command();
        cmd.stdout(Stdio::inherit());
        tracing::info!(
            path = %self.command.binary_path.display(),
            args = ?self.command.args(),
            "Exec app"
        );

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            binary: self.command.binary_path.clone(),
            source,
        })?;
        self.pid = child.id();

        let status = child.wait().await.map_err(ProcessError::Wait)?;
        self.state = ProcessState::Exited(status);
        Ok(status)
    }

    /// Terminate the app if it is running.
    ///
    /// Idempotent: a process that was never started or has already exited is
    /// left alone.
    ///
    /// # Errors
    ///
    /// [`ProcessError::KillFailed`] when the OS refuses to terminate the
    /// child. Callers treat this as fatal.
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        let ProcessState::Running(child) = &mut self.state else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "App already exited");
                self.state = ProcessState::Exited(status);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Could not poll app status, killing anyway"),
        }

        let pid = self.pid.unwrap_or_default();
        tracing::info!(pid, "Killing app server");
        child
            .kill()
            .await
            .map_err(|source| ProcessError::KillFailed { pid, source })?;

        let status = child.wait().await.map_err(ProcessError::Wait)?;
        self.state = ProcessState::Exited(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_command_args() {
        let cmd = AppCommand::new("/tmp/app", 9000)
            .with_import_path("github.com/acme/shop")
            .with_run_mode("prod");

        assert_eq!(
            cmd.args(),
            vec![
                "--port=9000".to_string(),
                "--import-path=github.com/acme/shop".to_string(),
                "--run-mode=prod".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_kill_before_start_is_noop() {
        let mut app = AppProcess::new(AppCommand::new("/nonexistent/app", 9000));
        app.kill().await.unwrap();
        app.kill().await.unwrap();
        assert_eq!(app.status(), ProcessStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails_to_spawn() {
        let mut app = AppProcess::new(AppCommand::new("/nonexistent/app", 9000));
        let err = app.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!app.is_running());
    }
}
