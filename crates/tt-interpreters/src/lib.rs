#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use tt_core::{Atom, ClosedProgram, Primitive, Program, Value, VarId};
use tt_lax::{EvalError, eval_primitive};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    ConstArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    UnexpectedOutputArity {
        primitive: Primitive,
        actual: usize,
    },
    Primitive(EvalError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::ConstArity { expected, actual } => {
                write!(
                    f,
                    "const arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::UnexpectedOutputArity { primitive, actual } => write!(
                f,
                "expected single-output primitive {}, got {} outputs",
                primitive.as_str(),
                actual
            ),
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

pub fn eval_program(program: &Program, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    eval_program_with_consts(program, &[], args)
}

pub fn eval_closed_program(
    closed: &ClosedProgram,
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_program_with_consts(&closed.program, &closed.const_values, args)
}

pub fn eval_program_with_consts(
    program: &Program,
    const_values: &[Value],
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    if const_values.len() != program.constvars.len() {
        return Err(InterpreterError::ConstArity {
            expected: program.constvars.len(),
            actual: const_values.len(),
        });
    }

    if args.len() != program.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }

    let mut env: FxHashMap<VarId, Value> = FxHashMap::default();
    for (var, value) in program.constvars.iter().zip(const_values) {
        env.insert(*var, value.clone());
    }
    for (var, value) in program.invars.iter().zip(args) {
        env.insert(*var, value.clone());
    }

    for eqn in &program.equations {
        if eqn.outputs.len() != 1 {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                actual: eqn.outputs.len(),
            });
        }

        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => {
                    let value = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    resolved.push(value);
                }
                Atom::Lit(lit) => resolved.push(Value::Scalar(*lit)),
            }
        }

        let output = eval_primitive(eqn.primitive, &resolved, &eqn.params)?;
        env.insert(eqn.outputs[0], output);
    }

    program
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}
