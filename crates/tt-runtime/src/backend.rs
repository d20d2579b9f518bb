//! Backend trait defining the uniform compile/execute interface.

use tt_core::{ClosedProgram, Value};
use tt_interpreters::InterpreterError;
use tt_lax::EvalError;

// ── Backend Errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Requested backend is not registered.
    Unavailable { backend: String },
    /// Lowering or validation failed before execution.
    CompileFailed { backend: String, detail: String },
    /// Executable was called with the wrong number of inputs.
    InputArity { expected: usize, actual: usize },
    /// Execution error from the backend.
    ExecutionFailed { detail: String },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { backend } => write!(f, "backend unavailable: {backend}"),
            Self::CompileFailed { backend, detail } => {
                write!(f, "compile failed on {backend}: {detail}")
            }
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "executable input arity mismatch: expected {expected}, got {actual}"
                )
            }
            Self::ExecutionFailed { detail } => write!(f, "execution failed: {detail}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<InterpreterError> for BackendError {
    fn from(value: InterpreterError) -> Self {
        match value {
            InterpreterError::InputArity { expected, actual } => {
                Self::InputArity { expected, actual }
            }
            other => Self::ExecutionFailed {
                detail: other.to_string(),
            },
        }
    }
}

impl From<EvalError> for BackendError {
    fn from(value: EvalError) -> Self {
        Self::ExecutionFailed {
            detail: value.to_string(),
        }
    }
}

// ── Backend Trait ──────────────────────────────────────────────────

/// A compiled program ready to run on host values.
pub trait Executable: Send + Sync {
    /// Name of the backend that produced this executable.
    fn backend_name(&self) -> &str;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError>;
}

/// Uniform interface for tensortrace compute backends.
pub trait Backend: Send + Sync {
    /// Registry name, e.g. "interpreter" or "xla".
    fn name(&self) -> &str;

    fn compile(&self, program: &ClosedProgram) -> Result<Box<dyn Executable>, BackendError>;
}

// ── Backend Registry ───────────────────────────────────────────────

/// Registry of available backends with priority-ordered selection.
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.available_backends())
            .finish()
    }
}

impl BackendRegistry {
    /// Create a registry with the given backends (first = highest priority).
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self { backends }
    }

    /// Look up a backend by name. Returns None if not found.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }

    /// Return the highest-priority (first) backend.
    #[must_use]
    pub fn default_backend(&self) -> Option<&dyn Backend> {
        self.backends.first().map(|b| b.as_ref())
    }

    /// List all registered backend names.
    #[must_use]
    pub fn available_backends(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Backend, BackendError> {
        self.get(name).ok_or_else(|| BackendError::Unavailable {
            backend: name.to_owned(),
        })
    }

    /// Resolve with fallback: if the requested backend is unavailable, fall
    /// back to the default backend. The flag reports whether a fallback occurred.
    pub fn resolve_with_fallback(&self, name: &str) -> Result<(&dyn Backend, bool), BackendError> {
        match self.resolve(name) {
            Ok(backend) => Ok((backend, false)),
            Err(BackendError::Unavailable { .. }) => {
                let fallback = self
                    .default_backend()
                    .ok_or_else(|| BackendError::Unavailable {
                        backend: "(no fallback)".to_owned(),
                    })?;
                log::warn!(
                    "backend '{name}' is not registered; using '{}' instead",
                    fallback.name()
                );
                Ok((fallback, true))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InterpreterBackend, XlaBackend};

    #[test]
    fn backend_error_display() {
        let err = BackendError::Unavailable {
            backend: "tpu".to_owned(),
        };
        assert_eq!(err.to_string(), "backend unavailable: tpu");

        let err = BackendError::CompileFailed {
            backend: "xla".to_owned(),
            detail: "bad fold".to_owned(),
        };
        assert!(err.to_string().contains("compile failed on xla"));
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = BackendRegistry::new(vec![
            Box::new(XlaBackend::new()),
            Box::new(InterpreterBackend::new()),
        ]);
        assert_eq!(registry.available_backends(), vec!["xla", "interpreter"]);
        let (backend, fell_back) = registry
            .resolve_with_fallback("interpreter")
            .expect("interpreter is registered");
        assert_eq!(backend.name(), "interpreter");
        assert!(!fell_back);
    }

    #[test]
    fn unknown_backend_falls_back_to_default() {
        let registry = BackendRegistry::new(vec![Box::new(InterpreterBackend::new())]);
        let (backend, fell_back) = registry
            .resolve_with_fallback("gpu")
            .expect("fallback should resolve");
        assert_eq!(backend.name(), "interpreter");
        assert!(fell_back);

        assert!(matches!(
            registry.resolve("gpu"),
            Err(BackendError::Unavailable { .. })
        ));
    }

    #[test]
    fn empty_registry_has_no_fallback() {
        let registry = BackendRegistry::new(Vec::new());
        assert!(registry.resolve_with_fallback("xla").is_err());
    }
}
