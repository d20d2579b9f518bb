#![forbid(unsafe_code)]

use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use tt_core::{Atom, ClosedProgram, Equation, Literal, Primitive, Program, ShapedArray, Value, VarId};
use tt_lax::infer_aval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TracerId(pub u32);

/// Operand of a recorded primitive: a tracer or an inline literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAtom {
    Tracer(TracerId),
    Lit(Literal),
}

impl From<TracerId> for TraceAtom {
    fn from(value: TracerId) -> Self {
        Self::Tracer(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    UnboundTracerInput {
        tracer_id: TracerId,
    },
    OutputShadowing {
        tracer_id: TracerId,
    },
    UnresolvedOutvar {
        tracer_id: TracerId,
    },
    UnorderedInput {
        tracer_id: TracerId,
    },
    DuplicateInput {
        tracer_id: TracerId,
    },
    ShapeInferenceFailed {
        primitive: Primitive,
        detail: String,
    },
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnboundTracerInput { tracer_id } => {
                write!(f, "unbound tracer input id {}", tracer_id.0)
            }
            Self::OutputShadowing { tracer_id } => {
                write!(f, "output shadows an existing tracer id {}", tracer_id.0)
            }
            Self::UnresolvedOutvar { tracer_id } => {
                write!(
                    f,
                    "unable to resolve output var for tracer id {}",
                    tracer_id.0
                )
            }
            Self::UnorderedInput { tracer_id } => {
                write!(
                    f,
                    "bound input tracer id {} is missing from the input order",
                    tracer_id.0
                )
            }
            Self::DuplicateInput { tracer_id } => {
                write!(f, "input tracer id {} appears twice", tracer_id.0)
            }
            Self::ShapeInferenceFailed { primitive, detail } => {
                write!(
                    f,
                    "shape inference failed for {}: {}",
                    primitive.as_str(),
                    detail
                )
            }
        }
    }
}

impl std::error::Error for TraceError {}

pub trait TraceContext {
    fn process_primitive(
        &mut self,
        primitive: Primitive,
        inputs: &[TraceAtom],
        params: BTreeMap<String, String>,
    ) -> Result<Vec<TracerId>, TraceError>;

    fn finalize(self) -> Result<ClosedProgram, TraceError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEquation {
    primitive: Primitive,
    inputs: Vec<TraceAtom>,
    outputs: Vec<TracerId>,
    params: BTreeMap<String, String>,
}

/// Records primitives over tracer ids and closes them into a program.
#[derive(Debug, Clone)]
pub struct SimpleTraceContext {
    next_tracer_id: u32,
    tracer_avals: BTreeMap<TracerId, ShapedArray>,
    const_values: BTreeMap<TracerId, Value>,
    in_ids: Vec<TracerId>,
    const_ids: Vec<TracerId>,
    equations: Vec<TraceEquation>,
    last_output_ids: Vec<TracerId>,
}

impl Default for SimpleTraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleTraceContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_tracer_id: 1,
            tracer_avals: BTreeMap::new(),
            const_values: BTreeMap::new(),
            in_ids: Vec::new(),
            const_ids: Vec::new(),
            equations: Vec::new(),
            last_output_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_inputs(in_avals: Vec<ShapedArray>) -> Self {
        let mut ctx = Self::new();
        for aval in in_avals {
            let _ = ctx.bind_input(aval);
        }
        ctx
    }

    pub fn bind_input(&mut self, aval: ShapedArray) -> TracerId {
        let tracer_id = self.allocate_tracer(aval);
        self.in_ids.push(tracer_id);
        tracer_id
    }

    pub fn bind_const_value(&mut self, value: Value) -> TracerId {
        let aval = ShapedArray::from_value(&value);
        let tracer_id = self.allocate_tracer(aval);
        self.const_values.insert(tracer_id, value);
        self.const_ids.push(tracer_id);
        tracer_id
    }

    #[must_use]
    pub fn input_ids(&self) -> &[TracerId] {
        &self.in_ids
    }

    #[must_use]
    pub fn equation_count(&self) -> usize {
        self.equations.len()
    }

    pub fn tracer_aval(&self, tracer_id: TracerId) -> Result<&ShapedArray, TraceError> {
        self.tracer_avals
            .get(&tracer_id)
            .ok_or(TraceError::UnboundTracerInput { tracer_id })
    }

    fn allocate_tracer(&mut self, aval: ShapedArray) -> TracerId {
        let tracer_id = TracerId(self.next_tracer_id);
        self.next_tracer_id += 1;
        self.tracer_avals.insert(tracer_id, aval);
        tracer_id
    }

    fn atom_aval(&self, atom: TraceAtom) -> Result<ShapedArray, TraceError> {
        match atom {
            TraceAtom::Tracer(tracer_id) => self.tracer_aval(tracer_id).cloned(),
            TraceAtom::Lit(lit) => Ok(ShapedArray::scalar(lit.dtype())),
        }
    }

    /// Close the trace with an explicit input order and output list.
    ///
    /// Every bound input must appear in `inputs` exactly once. Outputs may
    /// name inputs, constants or equation results.
    pub fn finalize_with(
        mut self,
        inputs: &[TracerId],
        outputs: &[TracerId],
    ) -> Result<ClosedProgram, TraceError> {
        let bound: BTreeSet<TracerId> = self.in_ids.iter().copied().collect();
        let mut ordered = BTreeSet::new();
        for tracer_id in inputs {
            if !bound.contains(tracer_id) {
                return Err(TraceError::UnboundTracerInput {
                    tracer_id: *tracer_id,
                });
            }
            if !ordered.insert(*tracer_id) {
                return Err(TraceError::DuplicateInput {
                    tracer_id: *tracer_id,
                });
            }
        }
        if let Some(missing) = self.in_ids.iter().find(|id| !ordered.contains(id)) {
            return Err(TraceError::UnorderedInput {
                tracer_id: *missing,
            });
        }

        let mut tracer_to_var: BTreeMap<TracerId, VarId> = BTreeMap::new();
        let mut next_var = 1_u32;
        let mut ensure_var = |tracer_to_var: &mut BTreeMap<TracerId, VarId>, tracer_id: TracerId| {
            *tracer_to_var.entry(tracer_id).or_insert_with(|| {
                let var = VarId(next_var);
                next_var += 1;
                var
            })
        };

        let invars = inputs
            .iter()
            .map(|tracer_id| ensure_var(&mut tracer_to_var, *tracer_id))
            .collect::<Vec<_>>();
        let constvars = self
            .const_ids
            .iter()
            .map(|tracer_id| ensure_var(&mut tracer_to_var, *tracer_id))
            .collect::<Vec<_>>();

        let mut equations = Vec::with_capacity(self.equations.len());
        for eqn in &self.equations {
            let mut in_atoms: SmallVec<[Atom; 4]> = SmallVec::with_capacity(eqn.inputs.len());
            for input in &eqn.inputs {
                match input {
                    TraceAtom::Tracer(input_id) => {
                        let var = tracer_to_var.get(input_id).copied().ok_or(
                            TraceError::UnboundTracerInput {
                                tracer_id: *input_id,
                            },
                        )?;
                        in_atoms.push(Atom::Var(var));
                    }
                    TraceAtom::Lit(lit) => in_atoms.push(Atom::Lit(*lit)),
                }
            }

            let mut out_vars: SmallVec<[VarId; 2]> = SmallVec::with_capacity(eqn.outputs.len());
            for output_id in &eqn.outputs {
                if tracer_to_var.contains_key(output_id) {
                    return Err(TraceError::OutputShadowing {
                        tracer_id: *output_id,
                    });
                }
                out_vars.push(ensure_var(&mut tracer_to_var, *output_id));
            }

            equations.push(Equation {
                primitive: eqn.primitive,
                inputs: in_atoms,
                outputs: out_vars,
                params: eqn.params.clone(),
            });
        }

        let outvars = outputs
            .iter()
            .map(|tracer_id| {
                tracer_to_var
                    .get(tracer_id)
                    .copied()
                    .ok_or(TraceError::UnresolvedOutvar {
                        tracer_id: *tracer_id,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let const_values = self
            .const_ids
            .iter()
            .map(|tracer_id| {
                self.const_values
                    .remove(tracer_id)
                    .ok_or(TraceError::UnboundTracerInput {
                        tracer_id: *tracer_id,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClosedProgram::new(
            Program::new(invars, constvars, outvars, equations),
            const_values,
        ))
    }
}

impl TraceContext for SimpleTraceContext {
    fn process_primitive(
        &mut self,
        primitive: Primitive,
        inputs: &[TraceAtom],
        params: BTreeMap<String, String>,
    ) -> Result<Vec<TracerId>, TraceError> {
        let input_avals = inputs
            .iter()
            .map(|atom| self.atom_aval(*atom))
            .collect::<Result<Vec<_>, _>>()?;

        let output_aval = infer_aval(primitive, &input_avals, &params).map_err(|err| {
            TraceError::ShapeInferenceFailed {
                primitive,
                detail: err.to_string(),
            }
        })?;
        let output_ids = vec![self.allocate_tracer(output_aval)];

        self.equations.push(TraceEquation {
            primitive,
            inputs: inputs.to_vec(),
            outputs: output_ids.clone(),
            params,
        });
        self.last_output_ids = output_ids.clone();

        Ok(output_ids)
    }

    /// Inputs in binding order; outputs are the last recorded equation's
    /// results, or the inputs when nothing was recorded.
    fn finalize(self) -> Result<ClosedProgram, TraceError> {
        let inputs = self.in_ids.clone();
        let outputs = if self.last_output_ids.is_empty() {
            self.in_ids.clone()
        } else {
            self.last_output_ids.clone()
        };
        self.finalize_with(&inputs, &outputs)
    }
}
