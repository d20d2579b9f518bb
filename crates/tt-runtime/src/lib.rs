#![forbid(unsafe_code)]

pub mod backend;
pub mod interpreter;
pub mod lowering;

pub use backend::{Backend, BackendError, BackendRegistry, Executable};
pub use interpreter::InterpreterBackend;
pub use lowering::{LoweredProgram, LoweringStats, XlaBackend, lower};

/// Registry holding every built-in backend, `xla` first.
#[must_use]
pub fn default_registry() -> BackendRegistry {
    BackendRegistry::new(vec![
        Box::new(XlaBackend::new()),
        Box::new(InterpreterBackend::new()),
    ])
}
