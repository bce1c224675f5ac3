//! Shell-safe command templating.
//!
//! Command templates are Jinja-style (`{{ var|q }}`, `{% if %}`,
//! `{% for %}`). The `q` filter shell-quotes its argument and is the only
//! legal path for substituted values: a template whose substitutions
//! would emit unquoted user input is rejected at startup by
//! [`TemplateEngine::audit`], never at request time. Rendering against a
//! schema-validated parameter set is total.

use std::collections::BTreeMap;

use minijinja::value::Value as TemplateValue;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::error::ConfigError;

/// Probe payload with one representative of every shell metacharacter
/// class. Quoting leaves no occurrence of the raw probe in the output.
const PROBE_SUFFIX: &str = "'\"$;|&<> ";

#[derive(Debug)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("q", quote);
        Self { env }
    }

    /// Render a command template against a parameter map. Values keep
    /// their scalar types so conditionals see real booleans; the `q`
    /// filter stringifies on substitution.
    ///
    /// The result is a single newline-free command line; newlines in the
    /// template collapse to spaces.
    pub fn render<S: Serialize>(&self, template: &str, params: S) -> Result<String, ConfigError> {
        let rendered = self
            .env
            .render_str(template, params)
            .map_err(|e| ConfigError::BadTemplate {
                application: String::new(),
                reason: e.to_string(),
            })?;
        Ok(collapse_newlines(&rendered))
    }

    /// Startup audit of a command template.
    ///
    /// Renders the template with probe values containing shell
    /// metacharacters for every schema property and rejects it when any
    /// probe surfaces unquoted, when the template references variables
    /// outside the schema, or when it fails to parse at all.
    pub fn audit(
        &self,
        application: &str,
        template: &str,
        properties: &[String],
    ) -> Result<(), ConfigError> {
        let mut probes = BTreeMap::new();
        for prop in properties {
            probes.insert(prop.clone(), probe_value(prop));
        }
        let rendered =
            self.render(template, &probes)
                .map_err(|e| match e {
                    ConfigError::BadTemplate { reason, .. } => ConfigError::BadTemplate {
                        application: application.to_string(),
                        reason,
                    },
                    other => other,
                })?;
        for prop in properties {
            if rendered.contains(&probes[prop]) {
                return Err(ConfigError::UnquotedSubstitution {
                    application: application.to_string(),
                    variable: prop.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Shell-quote a template value.
fn quote(value: TemplateValue) -> Result<String, minijinja::Error> {
    let text = if let Some(s) = value.as_str() {
        s.to_string()
    } else {
        value.to_string()
    };
    match shlex::try_quote(&text) {
        Ok(quoted) => Ok(quoted.into_owned()),
        Err(_) => Err(minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            "value contains a NUL byte and cannot be quoted",
        )),
    }
}

fn probe_value(prop: &str) -> String {
    format!("__probe_{prop}__{PROBE_SUFFIX}")
}

fn collapse_newlines(rendered: &str) -> String {
    let collapsed: String = rendered
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    collapsed.trim().to_string()
}
