//! The "xla" backend: lowers a closed program into a flat instruction list
//! over dense value slots, then executes that list.
//!
//! Lowering runs three passes:
//!
//! 1. constant folding of equations whose operands are literals or known
//!    constants,
//! 2. dead-code elimination against the program outputs,
//! 3. slot allocation, releasing each slot after its last reader so later
//!    results can reuse it.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use tt_core::{Atom, ClosedProgram, Equation, Literal, Primitive, Value, VarId};
use tt_lax::eval_primitive;

use crate::backend::{Backend, BackendError, Executable};

const BACKEND_NAME: &str = "xla";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Slot(usize),
    Lit(Literal),
}

#[derive(Debug, Clone)]
struct Instruction {
    primitive: Primitive,
    operands: Vec<Operand>,
    params: BTreeMap<String, String>,
    output: usize,
    /// Slots whose last reader is this instruction.
    release: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoweringStats {
    pub folded: usize,
    pub eliminated: usize,
    pub instructions: usize,
    pub slots: usize,
}

#[derive(Debug, Clone)]
pub struct LoweredProgram {
    /// Slot per program input; `None` for inputs nothing reads.
    input_slots: Vec<Option<usize>>,
    constants: Vec<(usize, Value)>,
    instructions: Vec<Instruction>,
    outputs: Vec<usize>,
    slot_count: usize,
    stats: LoweringStats,
}

fn compile_failed(detail: impl Into<String>) -> BackendError {
    BackendError::CompileFailed {
        backend: BACKEND_NAME.to_owned(),
        detail: detail.into(),
    }
}

pub fn lower(closed: &ClosedProgram) -> Result<LoweredProgram, BackendError> {
    let program = &closed.program;
    if closed.const_values.len() != program.constvars.len() {
        return Err(compile_failed(format!(
            "expected {} const values, got {}",
            program.constvars.len(),
            closed.const_values.len()
        )));
    }

    // ── Pass 1: constant folding ───────────────────────────────────
    let mut known: FxHashMap<VarId, Value> = program
        .constvars
        .iter()
        .copied()
        .zip(closed.const_values.iter().cloned())
        .collect();
    let mut remaining: Vec<&Equation> = Vec::with_capacity(program.equations.len());
    let mut folded = 0_usize;
    for eqn in &program.equations {
        if eqn.outputs.len() != 1 {
            return Err(compile_failed(format!(
                "{} must produce exactly one output, got {}",
                eqn.primitive.as_str(),
                eqn.outputs.len()
            )));
        }
        let foldable = eqn.inputs.iter().all(|atom| match atom {
            Atom::Lit(_) => true,
            Atom::Var(var) => known.contains_key(var),
        });
        if !foldable {
            remaining.push(eqn);
            continue;
        }
        let inputs = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Lit(lit) => Ok(Value::Scalar(*lit)),
                Atom::Var(var) => known
                    .get(var)
                    .cloned()
                    .ok_or_else(|| compile_failed(format!("unknown constant v{}", var.0))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let value = eval_primitive(eqn.primitive, &inputs, &eqn.params)
            .map_err(|err| compile_failed(format!("constant folding failed: {err}")))?;
        known.insert(eqn.outputs[0], value);
        folded += 1;
    }

    // ── Pass 2: dead-code elimination ──────────────────────────────
    let mut live: FxHashSet<VarId> = program.outvars.iter().copied().collect();
    let mut kept: Vec<&Equation> = Vec::with_capacity(remaining.len());
    for eqn in remaining.iter().rev() {
        if !live.contains(&eqn.outputs[0]) {
            continue;
        }
        for atom in &eqn.inputs {
            if let Atom::Var(var) = atom {
                live.insert(*var);
            }
        }
        kept.push(*eqn);
    }
    kept.reverse();
    let eliminated = remaining.len() - kept.len();

    // ── Pass 3: slot allocation ────────────────────────────────────
    let mut last_use: FxHashMap<VarId, usize> = FxHashMap::default();
    for (idx, eqn) in kept.iter().enumerate() {
        for atom in &eqn.inputs {
            if let Atom::Var(var) = atom {
                last_use.insert(*var, idx);
            }
        }
    }
    for var in &program.outvars {
        last_use.insert(*var, usize::MAX);
    }

    let mut slot_of: FxHashMap<VarId, usize> = FxHashMap::default();
    let mut slot_count = 0_usize;
    let fresh_slot = |slot_count: &mut usize| {
        let slot = *slot_count;
        *slot_count += 1;
        slot
    };

    let mut input_slots = Vec::with_capacity(program.invars.len());
    for var in &program.invars {
        if last_use.contains_key(var) {
            let slot = fresh_slot(&mut slot_count);
            slot_of.insert(*var, slot);
            input_slots.push(Some(slot));
        } else {
            input_slots.push(None);
        }
    }

    let mut constants = Vec::new();
    let referenced = kept
        .iter()
        .flat_map(|eqn| eqn.inputs.iter())
        .filter_map(|atom| match atom {
            Atom::Var(var) => Some(*var),
            Atom::Lit(_) => None,
        })
        .chain(program.outvars.iter().copied());
    for var in referenced {
        if slot_of.contains_key(&var) {
            continue;
        }
        if let Some(value) = known.get(&var) {
            let slot = fresh_slot(&mut slot_count);
            slot_of.insert(var, slot);
            constants.push((slot, value.clone()));
        }
    }

    let mut free: Vec<usize> = Vec::new();
    let mut instructions = Vec::with_capacity(kept.len());
    for (idx, eqn) in kept.iter().enumerate() {
        let mut operands = Vec::with_capacity(eqn.inputs.len());
        let mut release = Vec::new();
        for atom in &eqn.inputs {
            match atom {
                Atom::Lit(lit) => operands.push(Operand::Lit(*lit)),
                Atom::Var(var) => {
                    let slot = *slot_of
                        .get(var)
                        .ok_or_else(|| compile_failed(format!("unbound variable v{}", var.0)))?;
                    operands.push(Operand::Slot(slot));
                    if last_use.get(var) == Some(&idx) && !release.contains(&slot) {
                        release.push(slot);
                    }
                }
            }
        }
        free.extend(release.iter().copied());
        let output = match free.pop() {
            Some(slot) => slot,
            None => fresh_slot(&mut slot_count),
        };
        slot_of.insert(eqn.outputs[0], output);
        instructions.push(Instruction {
            primitive: eqn.primitive,
            operands,
            params: eqn.params.clone(),
            output,
            release,
        });
    }

    let outputs = program
        .outvars
        .iter()
        .map(|var| {
            slot_of
                .get(var)
                .copied()
                .ok_or_else(|| compile_failed(format!("unresolved output v{}", var.0)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stats = LoweringStats {
        folded,
        eliminated,
        instructions: instructions.len(),
        slots: slot_count,
    };
    Ok(LoweredProgram {
        input_slots,
        constants,
        instructions,
        outputs,
        slot_count,
        stats,
    })
}

impl LoweredProgram {
    #[must_use]
    pub fn stats(&self) -> LoweringStats {
        self.stats
    }

    pub fn run(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
        if args.len() != self.input_slots.len() {
            return Err(BackendError::InputArity {
                expected: self.input_slots.len(),
                actual: args.len(),
            });
        }

        let mut slots: Vec<Option<Value>> = vec![None; self.slot_count];
        for (slot, arg) in self.input_slots.iter().zip(args) {
            if let Some(slot) = slot {
                slots[*slot] = Some(arg.clone());
            }
        }
        for (slot, value) in &self.constants {
            slots[*slot] = Some(value.clone());
        }

        let mut operands = Vec::with_capacity(4);
        for instr in &self.instructions {
            operands.clear();
            for operand in &instr.operands {
                match operand {
                    Operand::Slot(slot) => operands.push(read_slot(&slots, *slot)?),
                    Operand::Lit(lit) => operands.push(Value::Scalar(*lit)),
                }
            }
            let value = eval_primitive(instr.primitive, &operands, &instr.params)?;
            for slot in &instr.release {
                slots[*slot] = None;
            }
            slots[instr.output] = Some(value);
        }

        self.outputs
            .iter()
            .map(|slot| read_slot(&slots, *slot))
            .collect()
    }
}

fn read_slot(slots: &[Option<Value>], slot: usize) -> Result<Value, BackendError> {
    slots
        .get(slot)
        .and_then(Option::clone)
        .ok_or_else(|| BackendError::ExecutionFailed {
            detail: format!("slot {slot} read while empty"),
        })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XlaBackend;

impl XlaBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Backend for XlaBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn compile(&self, program: &ClosedProgram) -> Result<Box<dyn Executable>, BackendError> {
        let lowered = lower(program)?;
        let stats = lowered.stats();
        log::debug!(
            "lowered program: {} instructions, {} folded, {} eliminated, {} slots",
            stats.instructions,
            stats.folded,
            stats.eliminated,
            stats.slots
        );
        Ok(Box::new(XlaExecutable { lowered }))
    }
}

struct XlaExecutable {
    lowered: LoweredProgram,
}

impl Executable for XlaExecutable {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn input_count(&self) -> usize {
        self.lowered.input_slots.len()
    }

    fn output_count(&self) -> usize {
        self.lowered.outputs.len()
    }

    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
        self.lowered.run(args)
    }
}
