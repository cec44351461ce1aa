//! Harness configuration with multi-source loading.
//!
//! Priority: environment (`FOB_HARNESS_*`) > `harness.toml` > defaults.
//! Nested keys use a double underscore, e.g. `FOB_HARNESS_WATCH__MODE=eager`.

use crate::coordinator::{CoordinatorOptions, DispatchMode, WatchMode};
use crate::error::ConfigError;
use crate::supervisor::{AppCommand, DEFAULT_READY_PATTERN};
use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory.
pub const CONFIG_FILE: &str = "harness.toml";

/// Top-level harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarnessConfig {
    /// Identifier of the app, passed to it as `--import-path`
    pub import_path: String,

    /// Run mode passed to the app as `--run-mode`
    pub run_mode: String,

    /// Root directory of the app; relative paths below resolve against it
    pub app_root: PathBuf,

    /// Source roots to watch and hand to the source info provider
    pub code_paths: Vec<PathBuf>,

    /// Seconds the app gets to print its ready line
    pub startup_timeout_secs: u64,

    /// Lines that mark the app as ready; any one is enough
    pub ready_patterns: Vec<String>,

    /// Link template for error pages, e.g. `vscode://file/{{Path}}:{{Line}}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_link: Option<String>,

    pub watch: WatchConfig,
    pub proxy: ProxyConfig,
    pub build: BuildConfig,
}

/// Change watching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Disabled means build once and run the app in the foreground
    pub enabled: bool,
    pub mode: WatchMode,
    pub dispatch: DispatchMode,
    /// Debounce window in milliseconds
    pub rebuild_delay_ms: u64,
    /// Extensions (without dot) whose changes trigger a rebuild
    pub source_extensions: Vec<String>,
    /// Directory names never watched
    pub ignore_dirs: Vec<String>,
}

/// Dev proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Without the proxy, a timer checks for changes instead of requests
    pub enabled: bool,
    /// Address the proxy listens on
    pub addr: SocketAddr,
    /// Port the app is started on; 0 picks a free one
    pub app_port: u16,
}

/// How the app is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Binary produced by the build, relative to `appRoot`
    pub binary: PathBuf,
    /// Scratch directory for generated files, relative to `appRoot`
    pub tmp_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            import_path: String::new(),
            run_mode: "dev".to_string(),
            app_root: PathBuf::from("."),
            code_paths: vec![PathBuf::from("app")],
            startup_timeout_secs: 60,
            ready_patterns: vec![DEFAULT_READY_PATTERN.to_string()],
            error_link: None,
            watch: WatchConfig::default(),
            proxy: ProxyConfig::default(),
            build: BuildConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: WatchMode::Normal,
            dispatch: DispatchMode::Debounced,
            rebuild_delay_ms: 1000,
            source_extensions: vec!["rs".to_string()],
            ignore_dirs: vec!["tmp".to_string(), "routes".to_string()],
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            app_port: 0,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: vec!["build".to_string()],
            binary: PathBuf::from("target/debug/app"),
            tmp_dir: PathBuf::from("tmp"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    ///
    /// Without an explicit path, `harness.toml` in the working directory is
    /// used when it exists.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let config_file = config_path.map(Path::to_path_buf).or_else(|| {
            let default_path = Path::new(CONFIG_FILE);
            default_path.exists().then(|| default_path.to_path_buf())
        });
        if let Some(path) = config_file {
            tracing::debug!(path = %path.display(), "Loading harness config file");
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("FOB_HARNESS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Extract(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.enabled && self.code_paths.is_empty() {
            return Err(invalid(
                "codePaths",
                "[]",
                "At least one source root must be watched",
            ));
        }

        if self.watch.rebuild_delay_ms == 0 {
            return Err(invalid(
                "watch.rebuildDelayMs",
                "0",
                "Use a positive delay so bursts of saves coalesce into one rebuild",
            ));
        }

        if self.startup_timeout_secs == 0 {
            return Err(invalid(
                "startupTimeoutSecs",
                "0",
                "The app needs time to start; the default is 60",
            ));
        }

        if self.ready_patterns.iter().all(|p| p.is_empty()) {
            return Err(invalid(
                "readyPatterns",
                &format!("{:?}", self.ready_patterns),
                "Provide the line the app prints once it is listening",
            ));
        }

        if self.proxy.enabled && self.proxy.app_port != 0 && self.proxy.app_port == self.proxy.addr.port() {
            return Err(invalid(
                "proxy.appPort",
                &self.proxy.app_port.to_string(),
                "The app cannot listen on the proxy's port",
            ));
        }

        if self.build.command.trim().is_empty() {
            return Err(invalid("build.command", "\"\"", "Set the command that builds the app"));
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            watch_mode: self.watch.mode,
            dispatch: self.watch.dispatch,
            refresh_interval: Duration::from_millis(self.watch.rebuild_delay_ms),
        }
    }

    /// Code roots resolved against `app_root`.
    pub fn resolved_code_paths(&self) -> Vec<PathBuf> {
        self.code_paths.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn resolved_tmp_dir(&self) -> PathBuf {
        self.resolve(&self.build.tmp_dir)
    }

    /// Launch parameters for a freshly built binary.
    pub fn app_command(&self, binary: PathBuf, port: u16) -> AppCommand {
        AppCommand::new(binary, port)
            .with_import_path(self.import_path.clone())
            .with_run_mode(self.run_mode.clone())
            .with_ready_patterns(self.ready_patterns.clone())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.app_root.join(path)
        }
    }
}

fn invalid(field: &str, value: &str, hint: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        hint: hint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.startup_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.coordinator_options().refresh_interval,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_zero_delay_is_rejected() {
        let mut config = HarnessConfig::default();
        config.watch.rebuild_delay_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watch.rebuildDelayMs"));
    }

    #[test]
    fn test_app_port_clash_is_rejected() {
        let mut config = HarnessConfig::default();
        config.proxy.app_port = config.proxy.addr.port();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_resolve_against_app_root() {
        let config = HarnessConfig {
            app_root: PathBuf::from("/srv/shop"),
            code_paths: vec![PathBuf::from("app"), PathBuf::from("/abs/lib")],
            ..HarnessConfig::default()
        };

        assert_eq!(
            config.resolved_code_paths(),
            vec![PathBuf::from("/srv/shop/app"), PathBuf::from("/abs/lib")]
        );
        assert_eq!(config.resolved_tmp_dir(), PathBuf::from("/srv/shop/tmp"));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("harness.toml");
        fs::write(
            &path,
            r#"
importPath = "shop"
runMode = "test"

[watch]
mode = "eager"
dispatch = "serial"
rebuildDelayMs = 250

[proxy]
appPort = 9100
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(Some(&path)).unwrap();

        assert_eq!(config.import_path, "shop");
        assert_eq!(config.run_mode, "test");
        assert_eq!(config.watch.mode, WatchMode::Eager);
        assert_eq!(config.watch.dispatch, DispatchMode::Serial);
        assert_eq!(config.watch.rebuild_delay_ms, 250);
        assert_eq!(config.proxy.app_port, 9100);
        // Untouched sections keep their defaults
        assert_eq!(config.build, BuildConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_rejects_bad_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("harness.toml");
        fs::write(&path, "[watch]\nmode = \"lazy\"\n").unwrap();

        let err = HarnessConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Extract(_)));
    }

    #[test]
    fn test_app_command_uses_config() {
        let config = HarnessConfig {
            import_path: "shop".to_string(),
            run_mode: "prod".to_string(),
            ..HarnessConfig::default()
        };
        let cmd = config.app_command(PathBuf::from("/bin/shop"), 9123);
        assert_eq!(cmd.port, 9123);
        assert_eq!(cmd.run_mode, "prod");
        assert_eq!(cmd.import_path, "shop");
        assert_eq!(cmd.ready_patterns, vec![DEFAULT_READY_PATTERN.to_string()]);
    }
}
