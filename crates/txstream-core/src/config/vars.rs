//! Environment variable interpolation for config files.
//!
//! Secrets such as broker lists and storage credentials are injected through
//! the environment rather than committed to YAML. Supported syntax:
//! - `$VAR` or `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<default>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("env var pattern is a valid regex")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found, so all missing variables are reported at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// How a `${VAR...}` reference falls back when the variable is unusable.
enum Fallback<'a> {
    /// No default: a missing variable is an error.
    Required,
    /// `${VAR-default}`: only an unset variable falls back.
    IfUnset(&'a str),
    /// `${VAR:-default}`: unset or empty falls back.
    IfUnsetOrEmpty(&'a str),
}

impl<'a> Fallback<'a> {
    fn from_captures(caps: &Captures<'a>) -> Self {
        let default = caps.name("default").map_or("", |m| m.as_str());
        match caps.name("op").map(|m| m.as_str()) {
            Some(":-") => Fallback::IfUnsetOrEmpty(default),
            Some(_) => Fallback::IfUnset(default),
            None => Fallback::Required,
        }
    }
}

/// Resolve a single variable reference, or describe why it cannot be resolved.
fn resolve(name: &str, fallback: Fallback<'_>) -> Result<String, String> {
    match (env::var(name), fallback) {
        (Ok(value), _) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        (Ok(value), Fallback::IfUnsetOrEmpty(default)) if value.is_empty() => {
            Ok(default.to_string())
        }
        (Ok(value), _) => Ok(value),
        (Err(_), Fallback::IfUnset(default) | Fallback::IfUnsetOrEmpty(default)) => {
            Ok(default.to_string())
        }
        (Err(_), Fallback::Required) => Err(format!("environment variable '{name}' is not set")),
    }
}

/// Interpolate environment variables in the given text.
///
/// Unresolvable references are left verbatim in the output and recorded in
/// `errors`.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            if caps.name("escape").is_some() {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return caps[0].to_string();
            };

            match resolve(name.as_str(), Fallback::from_captures(caps)) {
                Ok(value) => value,
                Err(message) => {
                    errors.push(message);
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
