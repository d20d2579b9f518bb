//! Options controlling how a traced function compiles and dispatches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::JitError;

pub const BACKEND_ENV: &str = "TENSORTRACE_BACKEND";
pub const DISABLE_ENV: &str = "TENSORTRACE_DISABLE_JIT";

/// What to do with a call whose signature has no compiled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecompilePolicy {
    /// Compile the first signature only; later unseen signatures run eagerly.
    FallbackToEager,
    /// Trace and compile every new signature.
    Retrace,
}

impl RecompilePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FallbackToEager => "fallback_to_eager",
            Self::Retrace => "retrace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 16 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    pub backend: String,
    pub policy: RecompilePolicy,
    /// Skip re-running the host function on cache hits.
    pub without_host: bool,
    /// When false every call runs eagerly.
    pub enabled: bool,
    pub cache: CacheConfig,
    /// Extra backend options; they take part in the cache key.
    pub compile_options: BTreeMap<String, String>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            backend: "xla".to_owned(),
            policy: RecompilePolicy::Retrace,
            without_host: false,
            enabled: true,
            cache: CacheConfig::default(),
            compile_options: BTreeMap::new(),
        }
    }
}

impl TraceOptions {
    /// Options of a partially traced function: one compiled signature,
    /// host function re-checked on every hit.
    #[must_use]
    pub fn partial(backend: &str) -> Self {
        Self {
            backend: backend.to_owned(),
            policy: RecompilePolicy::FallbackToEager,
            without_host: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn xla(without_host: bool) -> Self {
        Self {
            without_host,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: &str) -> Self {
        backend.clone_into(&mut self.backend);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RecompilePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_cache_entries(mut self, max_entries: usize) -> Self {
        self.cache.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_compile_option(mut self, key: &str, value: &str) -> Self {
        self.compile_options
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, JitError> {
        let options: Self = serde_json::from_str(raw).map_err(|err| JitError::Config {
            detail: err.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String, JitError> {
        serde_json::to_string(self).map_err(|err| JitError::Config {
            detail: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), JitError> {
        if self.backend.trim().is_empty() {
            return Err(JitError::Config {
                detail: "backend name must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// Apply `TENSORTRACE_BACKEND` and `TENSORTRACE_DISABLE_JIT` from the
    /// process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(backend) = lookup(BACKEND_ENV) {
            let backend = backend.trim();
            if backend.is_empty() {
                log::warn!("ignoring empty {BACKEND_ENV}");
            } else {
                log::debug!("backend overridden to '{backend}' by {BACKEND_ENV}");
                backend.clone_into(&mut self.backend);
            }
        }
        if let Some(flag) = lookup(DISABLE_ENV) {
            if matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                log::debug!("tracing disabled by {DISABLE_ENV}");
                self.enabled = false;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_pick_policies() {
        let partial = TraceOptions::partial("interpreter");
        assert_eq!(partial.policy, RecompilePolicy::FallbackToEager);
        assert_eq!(partial.backend, "interpreter");
        assert!(!partial.without_host);

        let xla = TraceOptions::xla(true);
        assert_eq!(xla.policy, RecompilePolicy::Retrace);
        assert_eq!(xla.backend, "xla");
        assert!(xla.without_host);
        assert_eq!(xla.cache.max_entries, 16);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let options =
            TraceOptions::from_json(r#"{"policy":"fallback_to_eager","cache":{"max_entries":2}}"#)
                .expect("json");
        assert_eq!(options.policy, RecompilePolicy::FallbackToEager);
        assert_eq!(options.cache.max_entries, 2);
        assert_eq!(options.backend, "xla");
        assert!(options.enabled);

        let back = TraceOptions::from_json(&options.to_json().expect("to_json")).expect("reparse");
        assert_eq!(back, options);
    }

    #[test]
    fn json_rejects_bad_input() {
        assert!(matches!(
            TraceOptions::from_json(r#"{"policy":"sometimes"}"#),
            Err(JitError::Config { .. })
        ));
        assert!(TraceOptions::from_json(r#"{"backend":"  "}"#).is_err());
    }

    #[test]
    fn overrides_replace_backend_and_disable() {
        let env = |key: &str| match key {
            BACKEND_ENV => Some("interpreter".to_owned()),
            DISABLE_ENV => Some("TRUE".to_owned()),
            _ => None,
        };
        let options = TraceOptions::xla(false).apply_overrides(env);
        assert_eq!(options.backend, "interpreter");
        assert!(!options.enabled);

        let untouched = TraceOptions::xla(false).apply_overrides(|key| match key {
            BACKEND_ENV => Some(" ".to_owned()),
            DISABLE_ENV => Some("0".to_owned()),
            _ => None,
        });
        assert_eq!(untouched, TraceOptions::xla(false));
    }

    #[test]
    fn builders_compose() {
        let options = TraceOptions::default()
            .with_backend("interpreter")
            .with_policy(RecompilePolicy::FallbackToEager)
            .with_cache_entries(1)
            .with_enabled(false)
            .with_compile_option("fold", "off");
        assert_eq!(options.backend, "interpreter");
        assert_eq!(options.cache.max_entries, 1);
        assert!(!options.enabled);
        assert_eq!(options.compile_options.get("fold").map(String::as_str), Some("off"));
    }
}
