//! Environment overlay for external tool invocations
//!
//! Every provisioning command of a run receives the same base overlay
//! (cluster name, admin identity). Retries derive a new overlay from the
//! base instead of mutating it, so the base stays valid for the next call site.

use std::collections::BTreeMap;

/// Variable read by terraform to select its log level
pub const VERBOSE_LOG_VAR: &str = "TF_LOG";

/// Log level requested on retried attempts
pub const VERBOSE_LOG_LEVEL: &str = "TRACE";

/// Immutable set of environment variables layered over the process environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvOverlay {
    /// Create an empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this overlay with `key` set to `value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Whether the overlay sets `key`
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Iterate over variables in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables in the overlay
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the overlay is empty
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Derive the overlay for a zero-based attempt index.
///
/// The first attempt runs with `env` unchanged. Later attempts request
/// trace-level logging from the provisioning tool.
pub fn with_verbose_logging(env: &EnvOverlay, attempt: u32) -> EnvOverlay {
    if attempt == 0 {
        return env.clone();
    }
    env.clone().with(VERBOSE_LOG_VAR, VERBOSE_LOG_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EnvOverlay {
        EnvOverlay::new()
            .with("CLUSTER", "smoke-abc123")
            .with("TF_VAR_tectonic_cluster_name", "smoke-abc123")
    }

    #[test]
    fn first_attempt_is_unchanged() {
        let env = base();
        assert_eq!(with_verbose_logging(&env, 0), env);
        assert!(!with_verbose_logging(&env, 0).contains(VERBOSE_LOG_VAR));
    }

    #[test]
    fn retries_request_trace_logging_without_touching_base() {
        let env = base();

        let second = with_verbose_logging(&env, 1);
        let third = with_verbose_logging(&env, 2);

        assert_eq!(second.get(VERBOSE_LOG_VAR), Some("TRACE"));
        assert_eq!(third.get(VERBOSE_LOG_VAR), Some("TRACE"));
        assert_eq!(second.get("CLUSTER"), Some("smoke-abc123"));
        assert_eq!(second.len(), env.len() + 1);
        assert!(!env.contains(VERBOSE_LOG_VAR));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let env = EnvOverlay::new().with("B", "2").with("A", "1");
        let keys: Vec<_> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }
}
