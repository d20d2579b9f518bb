//! Abstract evaluation: output avals computed from input avals alone.
//!
//! Every rule here mirrors the dtype and shape decisions its kernel makes,
//! so a traced program and its eager run agree on every intermediate aval.

use std::collections::BTreeMap;
use tt_core::{DType, Primitive, Shape, ShapedArray};

use crate::EvalError;
use crate::tensor_ops;

/// Numpy-style broadcast of two shapes, aligned on trailing axes.
#[must_use]
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = vec![0_u32; rank];
    for axis in 0..rank {
        let left = axis_from_end(lhs, rank - 1 - axis);
        let right = axis_from_end(rhs, rank - 1 - axis);
        dims[axis] = match (left, right) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(Shape { dims })
}

fn axis_from_end(shape: &Shape, from_end: usize) -> u32 {
    if from_end < shape.rank() {
        shape.dims[shape.rank() - 1 - from_end]
    } else {
        1
    }
}

/// Result dtype of an elementwise binary op.
///
/// A rank-0 operand against a tensor is weakly typed: it never widens a
/// float tensor, and only turns an integer tensor into `F64` when the
/// scalar itself is a float.
#[must_use]
pub fn binary_result_dtype(lhs: &ShapedArray, rhs: &ShapedArray) -> DType {
    let lhs_scalar = lhs.shape.rank() == 0;
    let rhs_scalar = rhs.shape.rank() == 0;
    let dtype = match (lhs_scalar, rhs_scalar) {
        (true, false) => weak_scalar_dtype(rhs.dtype, lhs.dtype),
        (false, true) => weak_scalar_dtype(lhs.dtype, rhs.dtype),
        _ => DType::promote(lhs.dtype, rhs.dtype),
    };
    if lhs_scalar && rhs_scalar {
        dtype.canonical_scalar()
    } else {
        dtype
    }
}

fn weak_scalar_dtype(tensor: DType, scalar: DType) -> DType {
    if tensor.is_float() {
        tensor
    } else if scalar.is_float() {
        DType::F64
    } else if tensor == DType::Bool {
        scalar
    } else {
        tensor
    }
}

pub(crate) fn reduce_dtype(dtype: DType) -> DType {
    if dtype == DType::Bool {
        DType::I64
    } else {
        dtype
    }
}

pub(crate) fn reduced_shape(shape: &Shape, axes: &[usize]) -> Shape {
    Shape {
        dims: shape
            .dims
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(_, dim)| *dim)
            .collect(),
    }
}

/// Operands of a dot viewed as an `m x k` by `k x n` product.
pub(crate) struct DotGeometry {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub out_shape: Shape,
}

pub(crate) fn dot_geometry(lhs: &Shape, rhs: &Shape) -> Result<DotGeometry, EvalError> {
    let primitive = Primitive::Dot;
    let mismatch = || EvalError::ShapeMismatch {
        primitive,
        left: lhs.clone(),
        right: rhs.clone(),
    };
    let (m, lhs_k, out_rows) = match lhs.dims.as_slice() {
        [] => (1, 1, None),
        [k] => (1, *k, None),
        [m, k] => (*m, *k, Some(*m)),
        _ => {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("dot lhs rank {} is not supported", lhs.rank()),
            });
        }
    };
    let (rhs_k, n, out_cols) = match rhs.dims.as_slice() {
        [] => (1, 1, None),
        [k] => (*k, 1, None),
        [k, n] => (*k, *n, Some(*n)),
        _ => {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("dot rhs rank {} is not supported", rhs.rank()),
            });
        }
    };
    if (lhs.rank() == 0) != (rhs.rank() == 0) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "dot mixes a scalar with a tensor; use mul".to_owned(),
        });
    }
    if lhs_k != rhs_k {
        return Err(mismatch());
    }
    let dims = [out_rows, out_cols].into_iter().flatten().collect();
    Ok(DotGeometry {
        m: m as usize,
        k: lhs_k as usize,
        n: n as usize,
        out_shape: Shape { dims },
    })
}

fn expect_arity(
    primitive: Primitive,
    inputs: &[ShapedArray],
    expected: usize,
) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

/// Output aval of `primitive` applied to operands with the given avals.
pub fn infer_aval(
    primitive: Primitive,
    inputs: &[ShapedArray],
    params: &BTreeMap<String, String>,
) -> Result<ShapedArray, EvalError> {
    let aval = match primitive {
        Primitive::Add | Primitive::Sub | Primitive::Mul => {
            expect_arity(primitive, inputs, 2)?;
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            let shape = broadcast_shapes(&lhs.shape, &rhs.shape).ok_or_else(|| {
                EvalError::ShapeMismatch {
                    primitive,
                    left: lhs.shape.clone(),
                    right: rhs.shape.clone(),
                }
            })?;
            ShapedArray::new(binary_result_dtype(lhs, rhs), shape)
        }
        Primitive::Neg => {
            expect_arity(primitive, inputs, 1)?;
            if inputs[0].dtype == DType::Bool {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "cannot negate a boolean value",
                });
            }
            inputs[0].clone()
        }
        Primitive::Dot => {
            expect_arity(primitive, inputs, 2)?;
            let geometry = dot_geometry(&inputs[0].shape, &inputs[1].shape)?;
            let dtype = DType::promote(inputs[0].dtype, inputs[1].dtype);
            if dtype == DType::Bool {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "dot expects numeric operands",
                });
            }
            ShapedArray::new(dtype, geometry.out_shape)
        }
        Primitive::ReduceSum => {
            expect_arity(primitive, inputs, 1)?;
            let axes = tensor_ops::resolve_reduce_axes(inputs[0].shape.rank(), params)?;
            ShapedArray::new(
                reduce_dtype(inputs[0].dtype),
                reduced_shape(&inputs[0].shape, &axes),
            )
        }
        Primitive::Reshape => {
            expect_arity(primitive, inputs, 1)?;
            let shape = tensor_ops::resolve_reshape(&inputs[0].shape, params)?;
            ShapedArray::new(inputs[0].dtype, shape)
        }
        Primitive::Transpose => {
            expect_arity(primitive, inputs, 1)?;
            let permutation = tensor_ops::resolve_permutation(inputs[0].shape.rank(), params)?;
            let dims = permutation
                .iter()
                .map(|axis| inputs[0].shape.dims[*axis])
                .collect();
            ShapedArray::new(inputs[0].dtype, Shape { dims })
        }
        Primitive::BroadcastInDim => {
            expect_arity(primitive, inputs, 1)?;
            let (target, _) = tensor_ops::resolve_broadcast(&inputs[0].shape, params)?;
            ShapedArray::new(inputs[0].dtype, target)
        }
        Primitive::ConvertElementType => {
            expect_arity(primitive, inputs, 1)?;
            ShapedArray::new(crate::parse_new_dtype(params)?, inputs[0].shape.clone())
        }
        Primitive::RngFold => {
            expect_arity(primitive, inputs, 1)?;
            crate::random::parse_salt(params)?;
            crate::random::expect_key_aval(primitive, &inputs[0])?;
            ShapedArray::scalar(DType::I64)
        }
        Primitive::DropoutMask => {
            expect_arity(primitive, inputs, 2)?;
            crate::random::parse_prob(params)?;
            crate::random::expect_key_aval(primitive, &inputs[1])?;
            ShapedArray::new(
                crate::random::mask_dtype(inputs[0].dtype),
                inputs[0].shape.clone(),
            )
        }
    };
    Ok(aval.canonical())
}
