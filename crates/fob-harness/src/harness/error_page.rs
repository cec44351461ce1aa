//! HTML error page shown in place of the app when a rebuild fails.

use crate::source_error::SourceError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use minijinja::{context, Environment};

const TEMPLATE_NAME: &str = "error.html";
const TEMPLATE: &str = include_str!("../../assets/error.html");

/// Renders [`SourceError`]s. Values are HTML-escaped; `link` is already
/// escaped by [`SourceError::set_link`] and inserted as is.
#[derive(Debug)]
pub struct ErrorPage {
    env: Environment<'static>,
}

impl ErrorPage {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, error: &SourceError) -> Result<String, minijinja::Error> {
        self.env.get_template(TEMPLATE_NAME)?.render(context! {
            error => error,
            context => error.context_source(),
        })
    }

    /// A 500 response carrying the rendered page.
    ///
    /// Falls back to plain text if the template fails to render.
    pub fn response(&self, error: &SourceError) -> Response {
        match self.render(error) {
            Ok(html) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [
                    (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                html,
            )
                .into_response(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to render error page");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    error.to_string(),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn located_error() -> SourceError {
        SourceError {
            title: "Compilation Error".to_string(),
            path: "src/main.rs".to_string(),
            description: "cannot find value `x` in this scope".to_string(),
            line: 3,
            column: 5,
            source_lines: vec![
                "fn main() {".to_string(),
                "    let y = 1;".to_string(),
                "    x + y".to_string(),
                "}".to_string(),
            ],
            ..SourceError::default()
        }
    }

    #[test]
    fn test_render_includes_context_and_highlight() {
        let page = ErrorPage::new().unwrap();
        let html = page.render(&located_error()).unwrap();

        assert!(html.contains("Compilation Error"));
        // '/' is escaped too
        assert!(html.contains("main.rs:3"));
        assert!(html.contains(r#"<tr class="error"><td class="line">3</td>"#));
        assert!(html.contains("let y = 1;"));
    }

    #[test]
    fn test_render_escapes_description() {
        let page = ErrorPage::new().unwrap();
        let err = SourceError::new("", "Build", "", "<script>alert(1)</script>");
        let html = page.render(&err).unwrap();

        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_link_is_rendered_as_anchor() {
        let page = ErrorPage::new().unwrap();
        let mut err = located_error();
        err.set_link("vscode://file/{{Path}}:{{Line}}");
        let html = page.render(&err).unwrap();

        assert!(html.contains("In <a href=\"vscode:"));
        assert!(html.contains("main.rs:3</a>"));
    }

    #[test]
    fn test_link_cannot_inject_markup() {
        let page = ErrorPage::new().unwrap();
        let mut err = SourceError::new("Rust code", "Compilation Error", "x\" onmouseover=\"alert(1)", "d");
        err.line = 1;
        err.set_link("editor:{{Path}}:{{Line}}");
        let html = page.render(&err).unwrap();

        assert!(!html.contains("\" onmouseover=\""));
        assert!(html.contains("&quot; onmouseover=&quot;"));
    }

    #[test]
    fn test_response_status() {
        let page = ErrorPage::new().unwrap();
        let response = page.response(&located_error());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
