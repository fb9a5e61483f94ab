// Variable Substitution
// Expands environment references inside a container's configuration

use crate::pipeline::models::Container;

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::error;

const REFERENCE_PATTERN: &str =
    r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)";

fn reference_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(REFERENCE_PATTERN) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                error!(error = %err, "unable to compile substitution pattern");
                None
            }
        })
        .as_ref()
}

impl Container {
    /// Expand `${VAR}`, `${VAR:-default}` and `$VAR` references from the container's
    /// own environment in the image, entrypoint, commands and environment values.
    pub fn substitute(&mut self) {
        let env = self.environment.clone();

        self.image = expand(&self.image, &env);
        for entry in self.entrypoint.iter_mut() {
            *entry = expand(entry, &env);
        }
        for command in self.commands.iter_mut() {
            *command = expand(command, &env);
        }
        for value in self.environment.values_mut() {
            *value = expand(value, &env);
        }
    }
}

/// Expand references in a single string.
///
/// Unknown variables are left as written so the shell inside the container can
/// still resolve them. Substituted values are escape-decoded once, which is why
/// secrets carrying literal `\n` sequences must be escaped beforehand.
pub fn expand(input: &str, env: &HashMap<String, String>) -> String {
    let pattern = match reference_pattern() {
        Some(pattern) if input.contains('$') => pattern,
        _ => return input.to_string(),
    };

    pattern
        .replace_all(input, |caps: &Captures| {
            let whole = caps.get(0).map_or("", |m| m.as_str());
            if whole == "$$" {
                return "$".to_string();
            }

            let name = caps
                .get(1)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());

            match env.get(name) {
                Some(value) if !value.is_empty() => decode_escapes(value),
                _ => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None if env.contains_key(name) => String::new(),
                    None => whole.to_string(),
                },
            }
        })
        .into_owned()
}

/// Decode one level of backslash escapes: `\\`, `\n`, `\t` and `\"`
pub fn decode_escapes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        match chars.peek().copied() {
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('t') => {
                out.push('\t');
                chars.next();
            }
            Some('\\') => {
                out.push('\\');
                chars.next();
            }
            Some('"') => {
                out.push('"');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }

    out
}
