use std::collections::BTreeMap;
use tt_core::{Literal, Primitive, Shape, Value};

use crate::{EvalError, advance_coords, check_arity, row_major_strides};

/// Parse a comma-separated list of i64 values from a param string.
pub(crate) fn parse_i64_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<i64>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim().parse::<i64>().map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("invalid integer in param '{key}': '{s}'"),
            })
        })
        .collect()
}

/// Parse a comma-separated list of usize values from a param string.
pub(crate) fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| EvalError::Unsupported {
                    primitive,
                    detail: format!("invalid usize in param '{key}': '{s}'"),
                })
        })
        .collect()
}

/// Axes named by `axes`, or all of them when the param is absent.
pub(crate) fn resolve_reduce_axes(
    rank: usize,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let primitive = Primitive::ReduceSum;
    if !params.contains_key("axes") {
        return Ok((0..rank).collect());
    }
    let axes = parse_usize_param(primitive, "axes", params)?;
    let mut seen = vec![false; rank];
    for &axis in &axes {
        if axis >= rank || seen[axis] {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("invalid reduction axes {axes:?} for rank {rank}"),
            });
        }
        seen[axis] = true;
    }
    Ok(axes)
}

/// Target shape of a reshape. `new_shape` holds comma-separated dims with at
/// most one `-1` for an inferred axis.
pub(crate) fn resolve_reshape(
    input: &Shape,
    params: &BTreeMap<String, String>,
) -> Result<Shape, EvalError> {
    let primitive = Primitive::Reshape;
    let shape_spec = parse_i64_param(primitive, "new_shape", params)?;
    let elem_count = input.element_count().unwrap_or(0);

    let mut inferred_axis: Option<usize> = None;
    let mut known_product = 1_u64;
    let mut dims = Vec::with_capacity(shape_spec.len());
    for (idx, d) in shape_spec.iter().enumerate() {
        if *d == -1 {
            if inferred_axis.is_some() {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: "only one -1 inferred axis allowed in new_shape".into(),
                });
            }
            inferred_axis = Some(idx);
            dims.push(0_u32);
        } else if *d >= 0 {
            let du = *d as u32;
            known_product *= u64::from(du);
            dims.push(du);
        } else {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("invalid dim {d} in new_shape"),
            });
        }
    }

    if let Some(axis) = inferred_axis {
        if known_product == 0 || elem_count % known_product != 0 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "cannot infer dim: elem_count={elem_count} known_product={known_product}"
                ),
            });
        }
        dims[axis] = (elem_count / known_product) as u32;
    } else if known_product != elem_count {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: input.clone(),
            right: Shape { dims },
        });
    }
    Ok(Shape { dims })
}

/// Axis permutation from `permutation`; reverses the axes when absent.
pub(crate) fn resolve_permutation(
    rank: usize,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let primitive = Primitive::Transpose;
    let permutation = if params.contains_key("permutation") {
        parse_usize_param(primitive, "permutation", params)?
    } else {
        (0..rank).rev().collect()
    };

    if permutation.len() != rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "permutation length {} does not match rank {}",
                permutation.len(),
                rank
            ),
        });
    }
    let mut seen = vec![false; rank];
    for &p in &permutation {
        if p >= rank || seen[p] {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("invalid permutation: {permutation:?} for rank {rank}"),
            });
        }
        seen[p] = true;
    }
    Ok(permutation)
}

/// Target shape and the output axis each input axis maps to.
/// Params: `shape`, and optional `broadcast_dimensions` (default: trailing axes).
pub(crate) fn resolve_broadcast(
    input: &Shape,
    params: &BTreeMap<String, String>,
) -> Result<(Shape, Vec<usize>), EvalError> {
    let primitive = Primitive::BroadcastInDim;
    let target_dims = parse_i64_param(primitive, "shape", params)?
        .into_iter()
        .map(|d| {
            u32::try_from(d).map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("invalid target dim {d}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let out_rank = target_dims.len();
    let in_rank = input.rank();
    if in_rank > out_rank {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: input.clone(),
            right: Shape { dims: target_dims },
        });
    }

    let broadcast_dims = if params.contains_key("broadcast_dimensions") {
        parse_usize_param(primitive, "broadcast_dimensions", params)?
    } else {
        (out_rank - in_rank..out_rank).collect()
    };
    if broadcast_dims.len() != in_rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "broadcast_dimensions length {} must equal input rank {}",
                broadcast_dims.len(),
                in_rank
            ),
        });
    }
    for (in_axis, &out_axis) in broadcast_dims.iter().enumerate() {
        let in_dim = input.dims[in_axis];
        let ordered = in_axis == 0 || broadcast_dims[in_axis - 1] < out_axis;
        if out_axis >= out_rank || !ordered || (in_dim != 1 && in_dim != target_dims[out_axis]) {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: input.clone(),
                right: Shape { dims: target_dims },
            });
        }
    }
    Ok((Shape { dims: target_dims }, broadcast_dims))
}

pub(crate) fn eval_reshape(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    check_arity(Primitive::Reshape, inputs, 1)?;
    let input = &inputs[0];
    let shape = resolve_reshape(&input.shape(), params)?;
    Ok(Value::from_parts(
        input.dtype(),
        shape,
        input.literals().to_vec(),
    )?)
}

pub(crate) fn eval_transpose(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    check_arity(Primitive::Transpose, inputs, 1)?;
    let input = &inputs[0];
    let old_shape = input.shape();
    let rank = old_shape.rank();
    let permutation = resolve_permutation(rank, params)?;

    let old_dims = &old_shape.dims;
    let new_dims: Vec<u32> = permutation.iter().map(|&p| old_dims[p]).collect();
    let old_strides = row_major_strides(old_dims);
    let elements = input.literals();

    let mut new_elements = Vec::with_capacity(elements.len());
    let mut coords = vec![0_usize; rank];
    for _ in 0..elements.len() {
        let old_flat: usize = coords
            .iter()
            .zip(permutation.iter())
            .map(|(coord, &old_axis)| coord * old_strides[old_axis])
            .sum();
        new_elements.push(elements[old_flat]);
        advance_coords(&mut coords, &new_dims);
    }

    Ok(Value::from_parts(
        input.dtype(),
        Shape { dims: new_dims },
        new_elements,
    )?)
}

pub(crate) fn eval_broadcast_in_dim(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    check_arity(Primitive::BroadcastInDim, inputs, 1)?;
    let input = &inputs[0];
    let in_shape = input.shape();
    let (target, broadcast_dims) = resolve_broadcast(&in_shape, params)?;
    let out_rank = target.rank();
    let total = target.element_count().unwrap_or(0) as usize;

    let mut out_to_in: Vec<Option<usize>> = vec![None; out_rank];
    for (in_axis, &out_axis) in broadcast_dims.iter().enumerate() {
        out_to_in[out_axis] = Some(in_axis);
    }
    let in_strides = row_major_strides(&in_shape.dims);
    let source = input.literals();

    let mut elements: Vec<Literal> = Vec::with_capacity(total);
    let mut out_coords = vec![0_usize; out_rank];
    for _ in 0..total {
        let mut in_flat = 0_usize;
        for (out_axis, mapping) in out_to_in.iter().enumerate() {
            if let Some(in_axis) = mapping {
                if in_shape.dims[*in_axis] != 1 {
                    in_flat += out_coords[out_axis] * in_strides[*in_axis];
                }
            }
        }
        elements.push(source[in_flat]);
        advance_coords(&mut out_coords, &target.dims);
    }

    Ok(Value::from_parts(input.dtype(), target, elements)?)
}

#[cfg(test)]
mod tests {
    use super::{resolve_broadcast, resolve_reduce_axes, resolve_reshape};
    use crate::EvalError;
    use std::collections::BTreeMap;
    use tt_core::Shape;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn reshape_to_scalar_uses_empty_shape() {
        let shape = resolve_reshape(&Shape::vector(1), &params(&[("new_shape", "")]))
            .expect("reshape to scalar");
        assert_eq!(shape, Shape::scalar());
    }

    #[test]
    fn reshape_rejects_two_inferred_axes() {
        let err = resolve_reshape(&Shape::vector(4), &params(&[("new_shape", "-1,-1")]))
            .expect_err("two -1 axes should fail");
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }

    #[test]
    fn reduce_axes_reject_duplicates() {
        assert!(resolve_reduce_axes(2, &params(&[("axes", "1,1")])).is_err());
        assert_eq!(resolve_reduce_axes(3, &BTreeMap::new()), Ok(vec![0, 1, 2]));
    }

    #[test]
    fn broadcast_rejects_incompatible_dims() {
        assert!(resolve_broadcast(&Shape::vector(3), &params(&[("shape", "2,4")])).is_err());
        let (target, dims) = resolve_broadcast(&Shape::vector(1), &params(&[("shape", "2,4")]))
            .expect("size-one axis broadcasts");
        assert_eq!(target, Shape::matrix(2, 4));
        assert_eq!(dims, vec![1]);
    }
}
