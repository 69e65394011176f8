//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}` substitutes the value and fails when unset
//! - `${VAR:-default}` falls back when VAR is unset or empty
//! - `${VAR-default}` falls back only when VAR is unset
//! - `$$` is a literal `$`

use std::sync::LazyLock;

use regex::{Captures, Regex};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<default>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("interpolation pattern is valid")
});

/// Interpolated text plus every problem found along the way.
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    pub errors: Vec<String>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate variables from the process environment.
pub fn interpolate(input: &str) -> Interpolated {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate variables resolved by `lookup`.
///
/// Errors are collected rather than short-circuited so that a config with
/// several missing variables reports all of them at once.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Interpolated
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return whole.to_string();
            };
            let name = name.as_str();
            let op = caps.name("op").map(|m| m.as_str());
            let default = caps.name("default").map(|m| m.as_str());

            match (lookup(name), default) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    whole.to_string()
                }
                (Some(value), Some(default)) if value.is_empty() && op == Some(":-") => {
                    default.to_string()
                }
                (Some(value), _) => value,
                (None, Some(default)) => default.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    Interpolated { text, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        let result = interpolate_with("dir: $WORK/${NAME}", env(&[("WORK", "/tmp"), ("NAME", "hoser")]));
        assert!(result.is_ok());
        assert_eq!(result.text, "dir: /tmp/hoser");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        let result = interpolate_with("$ONE and ${TWO}", env(&[]));
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("ONE"));
        assert!(result.errors[1].contains("TWO"));
        assert_eq!(result.text, "$ONE and ${TWO}");
    }

    #[test]
    fn test_colon_default_applies_to_empty() {
        let lookup = env(&[("EMPTY", "")]);
        assert_eq!(interpolate_with("${EMPTY:-5000}", &lookup).text, "5000");
        assert_eq!(interpolate_with("${UNSET:-5000}", &lookup).text, "5000");
    }

    #[test]
    fn test_dash_default_keeps_empty() {
        let lookup = env(&[("EMPTY", "")]);
        assert_eq!(interpolate_with("[${EMPTY-x}]", &lookup).text, "[]");
        assert_eq!(interpolate_with("[${UNSET-x}]", &lookup).text, "[x]");
    }

    #[test]
    fn test_escaped_dollar() {
        let result = interpolate_with("cost: $$5", env(&[]));
        assert!(result.is_ok());
        assert_eq!(result.text, "cost: $5");
    }

    #[test]
    fn test_newline_injection_rejected() {
        let result = interpolate_with("v: $BAD", env(&[("BAD", "a\nb")]));
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("newlines"));
    }

    #[test]
    fn test_process_environment_lookup() {
        let result = interpolate("${HOSER_SURELY_UNSET_VARIABLE:-fallback}");
        assert_eq!(result.text, "fallback");
    }
}
