//! Prompt and error-message rendering.
//!
//! Templates use Tera placeholders (`{{ name }}`). A placeholder that is not present in the
//! context fails the render instead of producing an empty string.

use std::error::Error as _;

use tera::{Context, Tera};
use thiserror::Error;

use crate::session::ScenarioContext;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template does not parse: {message}")]
    Invalid { message: String },
    #[error("template rendering failed: {message}")]
    Render { message: String },
}

pub fn render(template: &str, values: &ScenarioContext) -> Result<String, TemplateError> {
    let mut context = Context::new();
    for (key, value) in values {
        context.insert(key.as_str(), value);
    }

    Tera::one_off(template, &context, false)
        .map_err(|error| TemplateError::Render { message: error_chain(&error) })
}

/// Parses the template without rendering it, so broken catalogs fail at load time.
pub fn check(template: &str) -> Result<(), TemplateError> {
    Tera::default()
        .add_raw_template("check", template)
        .map_err(|error| TemplateError::Invalid { message: error_chain(&error) })
}

/// Tera's own message followed by every underlying cause, `: `-separated.
pub fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::{check, error_chain, render, TemplateError};
    use crate::session::ScenarioContext;

    fn context(pairs: &[(&str, &str)]) -> ScenarioContext {
        pairs.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect()
    }

    #[test]
    fn substitutes_named_placeholders() {
        let rendered = render("Thanks, {{ name }} <{{ email }}>!", &context(&[
            ("name", "Vova"),
            ("email", "a@b.com"),
        ]))
        .expect("render");
        assert_eq!(rendered, "Thanks, Vova <a@b.com>!");
    }

    #[test]
    fn values_are_not_html_escaped() {
        let rendered = render("{{ name }}", &context(&[("name", "Tom & <Jerry>")])).expect("render");
        assert_eq!(rendered, "Tom & <Jerry>");
    }

    #[test]
    fn missing_placeholder_is_an_error() {
        let error = render("Hello, {{ name }}!", &ScenarioContext::new()).expect_err("must fail");
        assert!(
            matches!(error, TemplateError::Render { ref message } if message.contains("name")),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn error_chain_includes_the_underlying_cause() {
        let error = tera::Tera::one_off("{{ missing }}", &tera::Context::new(), false)
            .expect_err("missing variable");
        let message = error_chain(&error);
        assert!(message.starts_with(&error.to_string()), "{message}");
        assert!(message.contains("missing"), "{message}");
    }

    #[test]
    fn check_rejects_unbalanced_tags() {
        assert!(check("Plain text with {single} braces").is_ok());
        assert!(matches!(check("Broken {{ name"), Err(TemplateError::Invalid { .. })));
    }
}
