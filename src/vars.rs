//! Variable substitution for config string values.
//!
//! Two syntaxes are recognised: `${VAR}` / `${VAR:-default}` and
//! `#env:VAR#` / `#env:VAR:-default#`. Lookups go `.env` file, then the
//! process environment, then the inline default. Unresolved tokens are left
//! verbatim and reported.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Top-level keys whose subtree is handed to the script engine as-is apart
/// from `#env:` tokens.
pub const PROTECTED_KEYS: &[&str] = &["embeddedConfig"];

fn dollar_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)(?::-([^}]*))?\}").expect("literal pattern")
    })
}

fn hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#env:([A-Za-z_][A-Za-z0-9_.]*)(?::-([^#]*))?#").expect("literal pattern"))
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
    dotenv: BTreeMap<String, String>,
    process: BTreeMap<String, String>,
}

impl Variables {
    /// Load the project `.env` (if any) and snapshot the process environment.
    pub fn load(project_dir: &Path) -> Self {
        let mut dotenv = BTreeMap::new();
        let path = project_dir.join(".env");
        if path.exists() {
            match dotenvy::from_path_iter(&path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                dotenv.insert(key, value);
                            }
                            Err(err) => {
                                debug!(path = %path.display(), error = %err, "skipping malformed .env line")
                            }
                        }
                    }
                }
                Err(err) => debug!(path = %path.display(), error = %err, "unable to read .env"),
            }
        }
        Self::from_maps(dotenv, env::vars().collect())
    }

    pub fn from_maps(dotenv: BTreeMap<String, String>, process: BTreeMap<String, String>) -> Self {
        Self { dotenv, process }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.dotenv
            .get(name)
            .or_else(|| self.process.get(name))
            .map(String::as_str)
    }

    pub fn substitute_str(&self, input: &str, allow_dollar: bool, unresolved: &mut Vec<String>) -> String {
        let mut replace = |caps: &Captures| -> String {
            let name = &caps[1];
            if let Some(value) = self.lookup(name) {
                return value.to_string();
            }
            if let Some(default) = caps.get(2) {
                return default.as_str().to_string();
            }
            if !unresolved.iter().any(|existing| existing == name) {
                unresolved.push(name.to_string());
            }
            caps[0].to_string()
        };
        let hashed = hash_pattern().replace_all(input, &mut replace).into_owned();
        if !allow_dollar {
            return hashed;
        }
        dollar_pattern().replace_all(&hashed, &mut replace).into_owned()
    }

    /// Substitute every string in `value`; `protected` restricts the subtree
    /// to `#env:` tokens.
    pub fn substitute_value(&self, value: &Value, protected: bool, unresolved: &mut Vec<String>) -> Value {
        match value {
            Value::String(text) => Value::String(self.substitute_str(text, !protected, unresolved)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.substitute_value(item, protected, unresolved))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.substitute_value(item, protected, unresolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Substitute a whole config document, honouring [`PROTECTED_KEYS`].
    pub fn substitute_document(&self, document: &Value, unresolved: &mut Vec<String>) -> Value {
        let Value::Object(map) = document else {
            return self.substitute_value(document, false, unresolved);
        };
        Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let protected = PROTECTED_KEYS.contains(&key.as_str());
                    (key.clone(), self.substitute_value(item, protected, unresolved))
                })
                .collect(),
        )
    }
}
