//! Reference backend: runs the closed program through the interpreter as-is.

use tt_core::{ClosedProgram, Value};
use tt_interpreters::eval_closed_program;

use crate::backend::{Backend, BackendError, Executable};

#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterBackend;

impl InterpreterBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Backend for InterpreterBackend {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn compile(&self, program: &ClosedProgram) -> Result<Box<dyn Executable>, BackendError> {
        if program.const_values.len() != program.program.constvars.len() {
            return Err(BackendError::CompileFailed {
                backend: self.name().to_owned(),
                detail: format!(
                    "expected {} const values, got {}",
                    program.program.constvars.len(),
                    program.const_values.len()
                ),
            });
        }
        Ok(Box::new(InterpretedExecutable {
            program: program.clone(),
        }))
    }
}

struct InterpretedExecutable {
    program: ClosedProgram,
}

impl Executable for InterpretedExecutable {
    fn backend_name(&self) -> &str {
        "interpreter"
    }

    fn input_count(&self) -> usize {
        self.program.program.invars.len()
    }

    fn output_count(&self) -> usize {
        self.program.program.outvars.len()
    }

    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
        Ok(eval_closed_program(&self.program, args)?)
    }
}
