//! Structured build errors with source context.
//!
//! A `SourceError` is what a failed rebuild reports. It carries enough
//! information for the proxy to render an error page pointing at the
//! offending line instead of a generic failure.

use minijinja::HtmlEscape;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Lines of context shown on each side of the error line.
const CONTEXT_LINES: usize = 5;

/// rustc style: `error[E0425]: message` followed by ` --> path:line:col`.
static RUSTC_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^error(?:\[\w+\])?: (.+)\n\s*--> ([^:\n]+):(\d+):(\d+)").expect("valid regex")
});

/// Classic `path:line:col: message` (or `path:line: message`) output.
static LINE_COL_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([^:#\s][^:#\n]*):(\d+):(?:(\d+):)? (.*)$").expect("valid regex")
});

/// A build or source error, as presented to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceError {
    /// The kind of source that failed to build (e.g. "Rust code")
    pub source_type: String,
    pub title: String,
    pub path: String,
    pub description: String,
    /// 1-based line, 0 when unknown
    pub line: usize,
    /// 1-based column, 0 when unknown
    pub column: usize,
    /// The entire source file, split into lines
    pub source_lines: Vec<String>,
    /// Raw stack or compiler output, if any
    pub stack: String,
    /// Error that occurred while producing this error (e.g. unreadable file)
    pub meta_error: String,
    /// Optional HTML link wrapping `path:line`
    pub link: String,
}

/// One line of source surrounding an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLine {
    pub source: String,
    pub line: usize,
    pub is_error: bool,
}

impl SourceError {
    /// Create an error without location information.
    pub fn new(
        source_type: impl Into<String>,
        title: impl Into<String>,
        path: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            title: title.into(),
            path: path.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Error reported when the rebuilt app could not be started.
    pub fn startup(description: impl fmt::Display) -> Self {
        Self::new("", "App failed to start up", "", description.to_string())
    }

    /// Parse compiler output into a located error.
    ///
    /// Paths in the output are resolved against `base_dir` to load the
    /// offending file. When nothing in the output looks like a location, a
    /// generic "see console" error is returned and the raw output is kept in
    /// `stack`.
    pub fn from_compiler_output(output: &str, base_dir: &Path, error_link: Option<&str>) -> Self {
        let located = RUSTC_ERROR
            .captures(output)
            .map(|caps| {
                (
                    caps[2].trim().to_string(),
                    caps[3].parse().unwrap_or(0),
                    caps[4].parse().unwrap_or(0),
                    caps[1].trim().to_string(),
                )
            })
            .or_else(|| {
                LINE_COL_ERROR.captures(output).map(|caps| {
                    (
                        caps[1].trim().to_string(),
                        caps[2].parse().unwrap_or(0),
                        caps.get(3).and_then(|c| c.as_str().parse().ok()).unwrap_or(0),
                        caps[4].trim().to_string(),
                    )
                })
            });

        let Some((path, line, column, description)) = located else {
            tracing::error!(output = %output, "Failed to parse build errors");
            let mut err = Self::new(
                "Rust code",
                "Compilation Error",
                "",
                "See console for build error.",
            );
            err.stack = output.to_string();
            return err;
        };

        let mut err = Self {
            source_type: "Rust code".to_string(),
            title: "Compilation Error".to_string(),
            path,
            description,
            line,
            column,
            stack: output.to_string(),
            ..Self::default()
        };

        if let Some(link) = error_link.filter(|l| !l.is_empty()) {
            err.set_link(link);
        }

        let abs = base_dir.join(&err.path);
        match std::fs::read_to_string(&abs) {
            Ok(contents) => {
                err.source_lines = contents.lines().map(str::to_string).collect();
            }
            Err(e) => {
                err.meta_error = format!("{}: {}", abs.display(), e);
                tracing::info!(error = %e, path = %abs.display(), "Unable to read source for build error");
            }
        }

        err
    }

    /// Build a link from a template containing `{{Path}}` and `{{Line}}`.
    ///
    /// The result is HTML; both the href and the text are escaped.
    pub fn set_link(&mut self, template: &str) {
        let href = template
            .replace("{{Path}}", &self.path)
            .replace("{{Line}}", &self.line.to_string());
        self.link = format!(
            "<a href=\"{}\">{}:{}</a>",
            HtmlEscape(&href),
            HtmlEscape(&self.path),
            self.line
        );
    }

    /// A snippet of the source around the error line.
    ///
    /// Returns an empty vector when no source was loaded.
    pub fn context_source(&self) -> Vec<SourceLine> {
        if self.source_lines.is_empty() {
            return Vec::new();
        }

        let error_idx = self.line.saturating_sub(1);
        let start = error_idx.saturating_sub(CONTEXT_LINES);
        let end = (error_idx + CONTEXT_LINES).min(self.source_lines.len());
        if start >= end {
            return Vec::new();
        }

        self.source_lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, src)| {
                let line = start + i + 1;
                SourceLine {
                    source: src.clone(),
                    line,
                    is_error: line == self.line,
                }
            })
            .collect()
    }
}

impl fmt::Display for SourceError {
    /// e.g. `Compilation Error (in src/main.rs:51): expected one of ...`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = if self.path.is_empty() {
            String::new()
        } else if self.line != 0 {
            format!("(in {}:{})", self.path, self.line)
        } else {
            format!("(in {})", self.path)
        };

        match (self.title.is_empty(), loc.is_empty()) {
            (false, false) => write!(f, "{} {}: {}", self.title, loc, self.description),
            (false, true) => write!(f, "{}: {}", self.title, self.description),
            (true, _) => write!(f, "{}{}", loc, self.description),
        }
    }
}

impl std::error::Error for SourceError {}
