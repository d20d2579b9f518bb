//! Tape-based reverse-mode autodiff.
//!
//! While a [`GradManager`] is recording, every primitive with at least one
//! differentiable input is appended to a thread-local tape along with
//! snapshots of its inputs. `backward` walks the tape in reverse and
//! applies VJP rules expressed as tensor ops, so when it runs inside a
//! trace the backward pass is recorded into the same program.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tt_core::{DType, Literal, Primitive, ShapedArray};

use crate::errors::JitError;
use crate::functional;
use crate::module::Parameter;
use crate::ops::{Operand, Params};
use crate::tensor::{NodeRef, Tensor};

static NEXT_TAPE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TAPE: RefCell<Option<Tape>> = const { RefCell::new(None) };
}

enum SavedInput {
    Tensor { snapshot: Tensor, node: Option<usize> },
    Lit(Literal),
}

impl SavedInput {
    fn operand(&self) -> Operand {
        match self {
            Self::Tensor { snapshot, .. } => Operand::from(snapshot),
            Self::Lit(lit) => Operand::Lit(*lit),
        }
    }

    fn aval(&self) -> ShapedArray {
        match self {
            Self::Tensor { snapshot, .. } => snapshot.aval(),
            Self::Lit(lit) => ShapedArray::scalar(lit.dtype()),
        }
    }

    fn node(&self) -> Option<usize> {
        match self {
            Self::Tensor { node, .. } => *node,
            Self::Lit(_) => None,
        }
    }
}

struct OpNode {
    primitive: Primitive,
    params: Params,
    inputs: Vec<SavedInput>,
}

enum TapeNode {
    Leaf,
    Op(OpNode),
}

struct Tape {
    id: u64,
    nodes: Vec<TapeNode>,
    leaves: Vec<(Tensor, usize)>,
}

fn active_tape_id() -> Option<u64> {
    TAPE.with(|tape| tape.borrow().as_ref().map(|tape| tape.id))
}

/// Append `output = primitive(inputs)` to the active tape when any input
/// is differentiable. No-op when nothing is recording.
pub(crate) fn record_op(
    primitive: Primitive,
    inputs: &[Operand],
    params: Params,
    output: &Tensor,
) -> Result<(), JitError> {
    let Some(tape_id) = active_tape_id() else {
        return Ok(());
    };
    let nodes = inputs
        .iter()
        .map(|operand| match operand {
            Operand::Tensor(tensor) => tensor.node_on(tape_id),
            Operand::Lit(_) => None,
        })
        .collect::<Vec<_>>();
    if nodes.iter().all(Option::is_none) {
        return Ok(());
    }

    let saved = inputs
        .iter()
        .zip(nodes)
        .map(|(operand, node)| match operand {
            Operand::Tensor(tensor) => SavedInput::Tensor {
                snapshot: tensor.snapshot(),
                node,
            },
            Operand::Lit(lit) => SavedInput::Lit(*lit),
        })
        .collect();

    let index = TAPE.with(|tape| {
        tape.borrow_mut().as_mut().map(|tape| {
            tape.nodes.push(TapeNode::Op(OpNode {
                primitive,
                params,
                inputs: saved,
            }));
            tape.nodes.len() - 1
        })
    });
    if let Some(index) = index {
        output.set_node(Some(NodeRef {
            tape: tape_id,
            index,
        }));
    }
    Ok(())
}

/// Collects gradients of attached parameters.
#[derive(Debug, Default, Clone)]
pub struct GradManager {
    params: Vec<Tensor>,
}

/// Ends the recording when dropped, unless `backward` already consumed it.
#[derive(Debug)]
pub struct RecordGuard {
    tape: u64,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let _ = TAPE.try_with(|tape| {
            if let Ok(mut slot) = tape.try_borrow_mut() {
                if slot.as_ref().is_some_and(|tape| tape.id == self.tape) {
                    *slot = None;
                }
            }
        });
    }
}

impl GradManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `params`, giving each a zero gradient buffer if it has none.
    pub fn attach(mut self, params: impl IntoIterator<Item = Parameter>) -> Result<Self, JitError> {
        for param in params {
            let tensor = param.tensor().clone();
            if tensor.grad().is_none() {
                tensor.set_grad(Some(Tensor::zeros(&tensor.aval())?));
            }
            if !self.params.iter().any(|known| known.ptr_eq(&tensor)) {
                self.params.push(tensor);
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn attached(&self) -> &[Tensor] {
        &self.params
    }

    #[must_use]
    pub fn is_recording() -> bool {
        active_tape_id().is_some()
    }

    /// Start recording. Each attached parameter becomes a fresh tape leaf.
    pub fn record(&self) -> Result<RecordGuard, JitError> {
        TAPE.with(|tape| {
            let mut slot = tape.borrow_mut();
            if slot.is_some() {
                return Err(JitError::AlreadyRecording);
            }
            let id = NEXT_TAPE_ID.fetch_add(1, Ordering::Relaxed);
            let mut nodes = Vec::with_capacity(self.params.len());
            let mut leaves = Vec::with_capacity(self.params.len());
            for param in &self.params {
                let index = nodes.len();
                nodes.push(TapeNode::Leaf);
                param.set_node(Some(NodeRef { tape: id, index }));
                leaves.push((param.clone(), index));
            }
            *slot = Some(Tape { id, nodes, leaves });
            Ok(RecordGuard {
                tape: id,
                _not_send: PhantomData,
            })
        })
    }

    /// Stop recording, backpropagate `dy` from `y` and accumulate into the
    /// `grad` buffer of every attached parameter.
    pub fn backward(&self, y: &Tensor, dy: &Tensor) -> Result<(), JitError> {
        let tape = TAPE
            .with(|tape| tape.borrow_mut().take())
            .ok_or(JitError::NotRecording)?;
        if y.shape() != dy.shape() {
            return Err(JitError::InvalidArgument {
                detail: format!(
                    "output gradient shape {:?} does not match output shape {:?}",
                    dy.shape().dims,
                    y.shape().dims
                ),
            });
        }

        let mut adjoints: Vec<Option<Tensor>> = vec![None; tape.nodes.len()];
        if let Some(index) = y.node_on(tape.id) {
            adjoints[index] = Some(dy.clone());
        }

        for index in (0..tape.nodes.len()).rev() {
            let TapeNode::Op(op) = &tape.nodes[index] else {
                continue;
            };
            let Some(g) = adjoints[index].take() else {
                continue;
            };
            let grads = vjp(op, &g)?;
            for (input, grad) in op.inputs.iter().zip(grads) {
                let (Some(node), Some(grad)) = (input.node(), grad) else {
                    continue;
                };
                adjoints[node] = Some(match adjoints[node].take() {
                    Some(acc) => functional::add(&acc, &grad)?,
                    None => grad,
                });
            }
        }

        for (param, leaf) in &tape.leaves {
            let Some(buffer) = param.grad() else {
                continue;
            };
            let contribution = match adjoints[*leaf].take() {
                Some(g) => g,
                None => Tensor::zeros(&param.aval())?,
            };
            buffer.add_(&contribution)?;
        }
        log::debug!(
            "backward over {} tape nodes into {} parameters",
            tape.nodes.len(),
            tape.leaves.len()
        );
        Ok(())
    }
}

// ── VJP rules ──────────────────────────────────────────────────────

fn parse_axes(params: &Params, key: &str) -> Result<Option<Vec<usize>>, JitError> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(Some(Vec::new()));
    }
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| JitError::InvalidArgument {
                    detail: format!("invalid axis '{s}' in param '{key}'"),
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn as_i64_dims(shape: &tt_core::Shape) -> Vec<i64> {
    shape.dims.iter().map(|d| i64::from(*d)).collect()
}

/// Sum `g` down to `target`'s shape, undoing numpy broadcasting.
fn unbroadcast(g: &Tensor, target: &ShapedArray) -> Result<Tensor, JitError> {
    let shape = g.shape();
    if shape == target.shape {
        return Ok(g.clone());
    }
    let lead = shape.rank().saturating_sub(target.shape.rank());
    let axes = (0..shape.rank())
        .filter(|axis| {
            *axis < lead || (target.shape.dims[axis - lead] == 1 && shape.dims[*axis] != 1)
        })
        .collect::<Vec<_>>();
    let summed = if axes.is_empty() {
        g.clone()
    } else {
        functional::sum(g, Some(axes.as_slice()))?
    };
    if summed.shape() == target.shape {
        Ok(summed)
    } else {
        functional::reshape(&summed, &as_i64_dims(&target.shape))
    }
}

fn dot_vjp(inputs: &[SavedInput], g: &Tensor) -> Result<Vec<Option<Tensor>>, JitError> {
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (lhs_aval, rhs_aval) = (lhs.aval(), rhs.aval());
    let (a, b) = match (lhs, rhs) {
        (SavedInput::Tensor { snapshot: a, .. }, SavedInput::Tensor { snapshot: b, .. }) => (a, b),
        _ => {
            return Err(JitError::UnsupportedGradient {
                primitive: Primitive::Dot,
                detail: "dot with a literal operand".to_owned(),
            });
        }
    };
    let want_a = lhs.node().is_some();
    let want_b = rhs.node().is_some();
    match (lhs_aval.shape.dims.as_slice(), rhs_aval.shape.dims.as_slice()) {
        // <a, b> is a scalar.
        ([_], [_]) => Ok(vec![
            want_a.then(|| functional::mul(b, g)).transpose()?,
            want_b.then(|| functional::mul(a, g)).transpose()?,
        ]),
        ([_, _], [_, _]) => Ok(vec![
            want_a
                .then(|| functional::matmul(g, &functional::transpose(b, None)?))
                .transpose()?,
            want_b
                .then(|| functional::matmul(&functional::transpose(a, None)?, g))
                .transpose()?,
        ]),
        // [m,k] x [k] -> [m]
        ([m, _], [k]) => Ok(vec![
            want_a
                .then(|| {
                    let column = functional::reshape(g, &[i64::from(*m), 1])?;
                    let row = functional::reshape(b, &[1, i64::from(*k)])?;
                    functional::matmul(&column, &row)
                })
                .transpose()?,
            want_b
                .then(|| functional::matmul(&functional::transpose(a, None)?, g))
                .transpose()?,
        ]),
        // [k] x [k,n] -> [n]
        ([k], [_, n]) => Ok(vec![
            want_a.then(|| functional::matmul(b, g)).transpose()?,
            want_b
                .then(|| {
                    let column = functional::reshape(a, &[i64::from(*k), 1])?;
                    let row = functional::reshape(g, &[1, i64::from(*n)])?;
                    functional::matmul(&column, &row)
                })
                .transpose()?,
        ]),
        (lhs_dims, rhs_dims) => Err(JitError::UnsupportedGradient {
            primitive: Primitive::Dot,
            detail: format!("ranks ({}, {})", lhs_dims.len(), rhs_dims.len()),
        }),
    }
}

/// Input cotangents of one tape op, aligned with its inputs. `None` marks
/// inputs that need no gradient.
fn vjp(op: &OpNode, g: &Tensor) -> Result<Vec<Option<Tensor>>, JitError> {
    let inputs = &op.inputs;
    let wants = |index: usize| inputs[index].node().is_some();
    match op.primitive {
        Primitive::Add => Ok(vec![
            wants(0).then(|| unbroadcast(g, &inputs[0].aval())).transpose()?,
            wants(1).then(|| unbroadcast(g, &inputs[1].aval())).transpose()?,
        ]),
        Primitive::Sub => Ok(vec![
            wants(0).then(|| unbroadcast(g, &inputs[0].aval())).transpose()?,
            wants(1)
                .then(|| unbroadcast(&functional::neg(g)?, &inputs[1].aval()))
                .transpose()?,
        ]),
        Primitive::Mul => Ok(vec![
            wants(0)
                .then(|| unbroadcast(&functional::mul(g, inputs[1].operand())?, &inputs[0].aval()))
                .transpose()?,
            wants(1)
                .then(|| unbroadcast(&functional::mul(g, inputs[0].operand())?, &inputs[1].aval()))
                .transpose()?,
        ]),
        Primitive::Neg => Ok(vec![wants(0).then(|| functional::neg(g)).transpose()?]),
        Primitive::Dot => dot_vjp(inputs, g),
        Primitive::Transpose => {
            let rank = inputs[0].aval().shape.rank();
            let permutation = parse_axes(&op.params, "permutation")?
                .unwrap_or_else(|| (0..rank).rev().collect());
            let mut inverse = vec![0; permutation.len()];
            for (axis, source) in permutation.iter().enumerate() {
                inverse[*source] = axis;
            }
            Ok(vec![
                wants(0)
                    .then(|| functional::transpose(g, Some(inverse.as_slice())))
                    .transpose()?,
            ])
        }
        Primitive::ReduceSum => {
            let aval = inputs[0].aval();
            if aval.dtype == DType::Bool {
                return Ok(vec![None]);
            }
            let rank = aval.shape.rank();
            let axes = parse_axes(&op.params, "axes")?.unwrap_or_else(|| (0..rank).collect());
            let kept = (0..rank)
                .filter(|axis| !axes.contains(axis))
                .collect::<Vec<_>>();
            Ok(vec![
                wants(0)
                    .then(|| functional::broadcast_in_dim(g, &aval.shape.dims, Some(kept.as_slice())))
                    .transpose()?,
            ])
        }
        Primitive::Reshape => {
            let aval = inputs[0].aval();
            Ok(vec![
                wants(0)
                    .then(|| functional::reshape(g, &as_i64_dims(&aval.shape)))
                    .transpose()?,
            ])
        }
        Primitive::BroadcastInDim => {
            let aval = inputs[0].aval();
            let out = g.shape();
            let in_rank = aval.shape.rank();
            let mapped = parse_axes(&op.params, "broadcast_dimensions")?
                .unwrap_or_else(|| (out.rank() - in_rank..out.rank()).collect());
            let axes = (0..out.rank())
                .filter(|axis| match mapped.iter().position(|m| m == axis) {
                    None => true,
                    Some(in_axis) => aval.shape.dims[in_axis] == 1 && out.dims[*axis] != 1,
                })
                .collect::<Vec<_>>();
            Ok(vec![
                wants(0)
                    .then(|| {
                        let summed = if axes.is_empty() {
                            g.clone()
                        } else {
                            functional::sum(g, Some(axes.as_slice()))?
                        };
                        functional::reshape(&summed, &as_i64_dims(&aval.shape))
                    })
                    .transpose()?,
            ])
        }
        Primitive::ConvertElementType => {
            let dtype = inputs[0].aval().dtype;
            if !dtype.is_float() {
                return Ok(vec![None]);
            }
            Ok(vec![wants(0).then(|| functional::convert(g, dtype)).transpose()?])
        }
        Primitive::RngFold | Primitive::DropoutMask => Ok(vec![None; inputs.len()]),
    }
}
