//! Build collaborators used by each rebuild.
//!
//! Extracting handler metadata from source and compiling the app are not the
//! harness's job. It talks to them through two traits:
//!
//! - [`SourceInfoProvider`] inspects the code roots and describes the
//!   request handlers it found.
//! - [`Builder`] turns that description into a runnable binary.
//!
//! [`CommandBuilder`] is a `Builder` that shells out to a configured build
//! command, which covers most setups.

use crate::source_error::SourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// File name the source metadata is written to in the tmp directory.
pub const SOURCE_INFO_FILE: &str = "source_info.json";

/// Metadata about the app's request handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub handlers: Vec<HandlerInfo>,
    /// Packages that must be imported for their initialization side effects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_import_paths: Vec<String>,
}

/// A type exposing request handler methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    /// e.g. `Application`
    pub type_name: String,
    pub import_path: String,
    pub package_name: String,
    pub methods: Vec<MethodSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSpec {
    pub name: String,
    pub args: Vec<MethodArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodArg {
    pub name: String,
    /// e.g. `i64`, `Option<String>`
    pub type_expr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub import_path: String,
}

impl HandlerInfo {
    /// Fully qualified name, `import_path.TypeName`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.import_path, self.type_name)
    }
}

/// Describes the handlers found under a set of code roots.
#[async_trait]
pub trait SourceInfoProvider: Send + Sync {
    async fn source_info(&self, code_paths: &[PathBuf]) -> Result<SourceInfo, SourceError>;
}

/// Produces the app binary for one rebuild.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Build the app and return the path of the binary.
    ///
    /// # Errors
    ///
    /// A structured [`SourceError`] pointing at the failing source, never a
    /// generic failure.
    async fn build(&self, info: &SourceInfo) -> Result<PathBuf, SourceError>;
}

/// A provider that always returns the same metadata.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceInfo {
    info: SourceInfo,
}

impl StaticSourceInfo {
    pub fn new(info: SourceInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl SourceInfoProvider for StaticSourceInfo {
    async fn source_info(&self, _code_paths: &[PathBuf]) -> Result<SourceInfo, SourceError> {
        Ok(self.info.clone())
    }
}

/// Builds the app by running an external command.
///
/// Before each build the source metadata is written to
/// `<tmp_dir>/source_info.json` for code generation steps of the build to
/// pick up. A non-zero exit is parsed into a located [`SourceError`].
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
    /// Working directory of the build, also the base for error paths
    cwd: PathBuf,
    /// Binary produced by the build, relative to `cwd` unless absolute
    binary: PathBuf,
    tmp_dir: PathBuf,
    error_link: Option<String>,
}

impl CommandBuilder {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        cwd: impl Into<PathBuf>,
        binary: impl Into<PathBuf>,
    ) -> Self {
        let cwd = cwd.into();
        Self {
            program: program.into(),
            args,
            tmp_dir: cwd.join("tmp"),
            cwd,
            binary: binary.into(),
            error_link: None,
        }
    }

    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    /// Link template (`{{Path}}`, `{{Line}}`) attached to compile errors.
    pub fn with_error_link(mut self, link: Option<String>) -> Self {
        self.error_link = link;
        self
    }

    fn binary_path(&self) -> PathBuf {
        if self.binary.is_absolute() {
            self.binary.clone()
        } else {
            self.cwd.join(&self.binary)
        }
    }

    async fn write_source_info(&self, info: &SourceInfo) -> Result<(), SourceError> {
        let setup_error = |e: &dyn std::fmt::Display| {
            SourceError::new(
                "",
                "Build setup failed",
                self.tmp_dir.display().to_string(),
                e.to_string(),
            )
        };

        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| setup_error(&e))?;
        let json = serde_json::to_vec_pretty(info).map_err(|e| setup_error(&e))?;
        tokio::fs::write(self.tmp_dir.join(SOURCE_INFO_FILE), json)
            .await
            .map_err(|e| setup_error(&e))
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&self, info: &SourceInfo) -> Result<PathBuf, SourceError> {
        self.write_source_info(info).await?;

        let start = Instant::now();
        tracing::info!(program = %self.program, args = ?self.args, cwd = %self.cwd.display(), "Building app");

        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SourceError::new(
                    "",
                    "Build failed to run",
                    self.program.clone(),
                    e.to_string(),
                )
            })?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stdout));
            tracing::error!(status = %output.status, "Build detected an error");
            return Err(SourceError::from_compiler_output(
                &text,
                &self.cwd,
                self.error_link.as_deref(),
            ));
        }

        let binary = self.binary_path();
        if !binary.is_file() {
            return Err(SourceError::new(
                "",
                "Build produced no binary",
                binary.display().to_string(),
                "The build command succeeded but the configured binary does not exist",
            ));
        }

        tracing::info!(elapsed = ?start.elapsed(), binary = %binary.display(), "Build complete");
        Ok(binary)
    }
}

/// Whether `path` lies under the builder's tmp directory.
pub fn is_generated(path: &Path, tmp_dir: &Path) -> bool {
    path.starts_with(tmp_dir)
}
