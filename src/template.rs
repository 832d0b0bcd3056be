// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template rendering.
//!
//! Source entries ending in `.tmpl` are rendered against the __data
//! context__ before being deployed. The data context is the merged
//! configuration data handed over by [`Config`]. Rendering goes through the
//! [`TemplateEngine`] trait so the target state builder never cares which
//! engine sits behind it. The default engine is [`MiniJinja`].
//!
//! [`Config`]: crate::config::Config

use minijinja::{Environment, UndefinedBehavior};

/// String-keyed data that templates are rendered against.
pub type DataContext = toml::Table;

/// Render template text.
pub trait TemplateEngine {
    /// Render template `text` named `name` against `data`.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError`] if the template is malformed, or refers to
    ///   data that does not exist.
    fn render(&self, name: &str, text: &str, data: &DataContext) -> Result<String>;
}

/// Jinja2 style templates through minijinja.
///
/// Undefined variables are errors rather than empty strings, and trailing
/// newlines are kept as written.
#[derive(Debug, Default, Clone, Copy)]
pub struct MiniJinja;

impl MiniJinja {
    /// Construct new minijinja engine.
    pub fn new() -> Self {
        Self
    }
}

impl TemplateEngine for MiniJinja {
    fn render(&self, name: &str, text: &str, data: &DataContext) -> Result<String> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.template_from_named_str(name, text)
            .and_then(|template| template.render(data))
            .map_err(|err| TemplateError::new(name, err.to_string()))
    }
}

/// Template cannot be rendered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to render template {name:?}: {reason}")]
pub struct TemplateError {
    pub name: String,
    pub reason: String,
}

impl TemplateError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = TemplateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn data() -> anyhow::Result<DataContext> {
        Ok(toml::from_str(indoc! {r#"
            variable = "value"

            [git]
            email = "john@doe.com"
        "#})?)
    }

    #[test]
    fn render_keeps_trailing_newline() -> anyhow::Result<()> {
        let result = MiniJinja::new().render("dot_template.tmpl", "key = {{ \"value\" }}\n", &data()?)?;
        assert_eq!(result, "key = value\n");
        Ok(())
    }

    #[test]
    fn render_reads_data_context() -> anyhow::Result<()> {
        let template = indoc! {r#"
            [user]
              email = {{ git.email }}
            # {{ variable }}
        "#};
        let result = MiniJinja::new().render("dot_gitconfig.tmpl", template, &data()?)?;
        let expect = indoc! {r#"
            [user]
              email = john@doe.com
            # value
        "#};
        assert_eq!(result, expect);
        Ok(())
    }

    #[test]
    fn render_rejects_undefined_data() -> anyhow::Result<()> {
        let result = MiniJinja::new().render("dot_broken.tmpl", "{{ missing.key }}", &data()?);
        assert!(matches!(result, Err(TemplateError { ref name, .. }) if name == "dot_broken.tmpl"));
        Ok(())
    }

    #[test]
    fn render_rejects_bad_syntax() -> anyhow::Result<()> {
        let result = MiniJinja::new().render("dot_broken.tmpl", "{% if %}", &data()?);
        assert!(result.is_err());
        Ok(())
    }
}
