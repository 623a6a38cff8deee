use serde::{Deserialize, Serialize};

/// A credential that must never reach a log line.
///
/// `Debug` and `Display` print `***`; the value is only reachable through
/// [`expose`](Secret::expose).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Replace every occurrence of each non-empty secret in `line` with `***`.
pub fn redact(line: &str, secrets: &[Secret]) -> String {
    let mut out = line.to_string();
    for secret in secrets {
        if !secret.is_empty() && out.contains(secret.expose()) {
            out = out.replace(secret.expose(), "***");
        }
    }
    out
}
