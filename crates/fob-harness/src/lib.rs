//! Development harness for web applications.
//!
//! Watches the app's source tree, rebuilds on change, supervises the app
//! server process and fronts it with a reverse proxy that shows build errors
//! in the browser.
//!
//! # Architecture
//!
//! - [`watcher`]: registers source roots with the OS notification backend
//! - [`coordinator`]: decides when to rebuild and coalesces bursts of
//!   requests into one rebuild
//! - [`supervisor`]: launches the app and waits for its ready line
//! - [`harness`]: the rebuild listener, the proxy and the run loop
//!
//! ```rust,no_run
//! use fob_harness::{Harness, HarnessConfig, StaticSourceInfo};
//! use std::sync::Arc;
//!
//! # async fn example() -> fob_harness::Result<()> {
//! fob_harness::logger::init_logger(false, false, false);
//! let config = HarnessConfig::load(None)?;
//! let harness = Harness::with_command_builder(config, Arc::new(StaticSourceInfo::default()))?;
//! Arc::new(harness).run().await
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod harness;
pub mod logger;
pub mod source_error;
pub mod supervisor;
pub mod ui;
pub mod watcher;

pub use builder::{Builder, CommandBuilder, SourceInfo, SourceInfoProvider, StaticSourceInfo};
pub use config::HarnessConfig;
pub use coordinator::{CoordinatorOptions, DispatchMode, RebuildCoordinator, RefreshResult, WatchMode};
pub use error::{ConfigError, HarnessError, ProcessError, Result, WatchError};
pub use harness::{DevProxy, Harness};
pub use source_error::{SourceError, SourceLine};
pub use supervisor::{AppCommand, AppProcess, ProcessStatus};
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, Listener, WatchFilter};
