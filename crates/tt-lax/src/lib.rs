#![forbid(unsafe_code)]

mod infer;
mod random;
mod tensor_ops;

pub use infer::{binary_result_dtype, broadcast_shapes, infer_aval};
pub use random::{GOLDEN_GAMMA, fold_key, splitmix64};

use std::collections::BTreeMap;
use tt_core::{DType, Literal, Primitive, Shape, Value, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::TypeMismatch { primitive, detail } => {
                write!(f, "type mismatch for {}: {}", primitive.as_str(), detail)
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "shape mismatch for {}: left={:?} right={:?}",
                    primitive.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::Unsupported { primitive, detail } => {
                write!(f, "unsupported {} behavior: {}", primitive.as_str(), detail)
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        Primitive::Add => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_add, |a, b| a + b)
        }
        Primitive::Sub => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_sub, |a, b| a - b)
        }
        Primitive::Mul => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_mul, |a, b| a * b)
        }
        Primitive::Neg => eval_neg(inputs),
        Primitive::Dot => eval_dot(inputs),
        Primitive::ReduceSum => eval_reduce_sum(inputs, params),
        Primitive::Reshape => tensor_ops::eval_reshape(inputs, params),
        Primitive::Transpose => tensor_ops::eval_transpose(inputs, params),
        Primitive::BroadcastInDim => tensor_ops::eval_broadcast_in_dim(inputs, params),
        Primitive::ConvertElementType => eval_convert(inputs, params),
        Primitive::RngFold => random::eval_rng_fold(inputs, params),
        Primitive::DropoutMask => random::eval_dropout_mask(inputs, params),
    }
}

pub(crate) fn check_arity(
    primitive: Primitive,
    inputs: &[Value],
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

/// Row-major strides for `dims`, in elements.
pub(crate) fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1] as usize;
    }
    strides
}

/// Advance a row-major coordinate odometer by one position.
pub(crate) fn advance_coords(coords: &mut [usize], dims: &[u32]) {
    for axis in (0..coords.len()).rev() {
        coords[axis] += 1;
        if coords[axis] < dims[axis] as usize {
            return;
        }
        coords[axis] = 0;
    }
}

/// For every element of `out`, the flat index of the `src` element that
/// numpy-style broadcasting reads from.
fn broadcast_source_indices(src: &Shape, out: &Shape) -> Vec<usize> {
    let total = out.element_count().unwrap_or(0) as usize;
    let offset = out.rank() - src.rank();
    let strides = row_major_strides(&src.dims);
    let mut coords = vec![0_usize; out.rank()];
    let mut indices = Vec::with_capacity(total);
    for _ in 0..total {
        let mut flat = 0_usize;
        for (axis, dim) in src.dims.iter().enumerate() {
            if *dim != 1 {
                flat += coords[axis + offset] * strides[axis];
            }
        }
        indices.push(flat);
        advance_coords(&mut coords, &out.dims);
    }
    indices
}

#[inline]
fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (lhs_shape, rhs_shape) = (lhs.shape(), rhs.shape());
    let out_shape =
        broadcast_shapes(&lhs_shape, &rhs_shape).ok_or_else(|| EvalError::ShapeMismatch {
            primitive,
            left: lhs_shape.clone(),
            right: rhs_shape.clone(),
        })?;
    let dtype = binary_result_dtype(&lhs.aval(), &rhs.aval());

    let lhs_elems = lhs.literals();
    let rhs_elems = rhs.literals();
    let lhs_index = broadcast_source_indices(&lhs_shape, &out_shape);
    let rhs_index = broadcast_source_indices(&rhs_shape, &out_shape);

    let elements = lhs_index
        .iter()
        .zip(rhs_index.iter())
        .map(|(&li, &ri)| {
            binary_literal_op(
                lhs_elems[li],
                rhs_elems[ri],
                dtype,
                primitive,
                &int_op,
                &float_op,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Value::from_parts(dtype, out_shape, elements)?)
}

fn binary_literal_op(
    lhs: Literal,
    rhs: Literal,
    dtype: DType,
    primitive: Primitive,
    int_op: &impl Fn(i64, i64) -> i64,
    float_op: &impl Fn(f64, f64) -> f64,
) -> Result<Literal, EvalError> {
    if dtype.is_float() {
        let left = literal_to_f64(primitive, lhs)?;
        let right = literal_to_f64(primitive, rhs)?;
        return Ok(Literal::from_f64(float_op(left, right)));
    }
    let left = literal_to_i64(lhs);
    let right = literal_to_i64(rhs);
    Ok(Literal::I64(int_op(left, right)))
}

fn literal_to_f64(primitive: Primitive, literal: Literal) -> Result<f64, EvalError> {
    literal.as_f64().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected numeric operand",
    })
}

fn literal_to_i64(literal: Literal) -> i64 {
    match literal {
        Literal::I64(value) => value,
        Literal::Bool(value) => i64::from(value),
        Literal::F64Bits(bits) => f64::from_bits(bits) as i64,
    }
}

fn eval_neg(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Neg;
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let dtype = input.dtype();
    if dtype == DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "cannot negate a boolean value",
        });
    }
    let elements = input
        .literals()
        .iter()
        .map(|lit| match lit {
            Literal::I64(value) => Ok(Literal::I64(value.wrapping_neg())),
            Literal::F64Bits(bits) => Ok(Literal::from_f64(-f64::from_bits(*bits))),
            Literal::Bool(_) => Err(EvalError::TypeMismatch {
                primitive,
                detail: "cannot negate a boolean value",
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from_parts(dtype, input.shape(), elements)?)
}

pub(crate) fn parse_new_dtype(params: &BTreeMap<String, String>) -> Result<DType, EvalError> {
    let primitive = Primitive::ConvertElementType;
    let raw = params.get("new_dtype").ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: "missing required param 'new_dtype'".to_owned(),
    })?;
    DType::from_name(raw.trim()).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("unknown dtype '{raw}'"),
    })
}

fn eval_convert(inputs: &[Value], params: &BTreeMap<String, String>) -> Result<Value, EvalError> {
    check_arity(Primitive::ConvertElementType, inputs, 1)?;
    let dtype = parse_new_dtype(params)?;
    let input = &inputs[0];
    Ok(Value::from_parts(dtype, input.shape(), input.literals().to_vec())?)
}

/// Matrix product over ranks (0,0), (1,1), (2,1), (1,2) and (2,2).
fn eval_dot(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Dot;
    check_arity(primitive, inputs, 2)?;
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let geometry = infer::dot_geometry(&lhs.shape(), &rhs.shape())?;
    let dtype = DType::promote(lhs.dtype(), rhs.dtype());
    if dtype == DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "dot expects numeric operands",
        });
    }

    let (m, k, n) = (geometry.m, geometry.k, geometry.n);
    let lhs_elems = lhs.literals();
    let rhs_elems = rhs.literals();
    let mut elements = Vec::with_capacity(m * n);

    if dtype.is_float() {
        let a = lhs_elems
            .iter()
            .map(|lit| literal_to_f64(primitive, *lit))
            .collect::<Result<Vec<_>, _>>()?;
        let b = rhs_elems
            .iter()
            .map(|lit| literal_to_f64(primitive, *lit))
            .collect::<Result<Vec<_>, _>>()?;
        for row in 0..m {
            for col in 0..n {
                let mut acc = 0.0_f64;
                for inner in 0..k {
                    acc += a[row * k + inner] * b[inner * n + col];
                }
                elements.push(Literal::from_f64(acc));
            }
        }
    } else {
        let a = lhs_elems.iter().copied().map(literal_to_i64).collect::<Vec<_>>();
        let b = rhs_elems.iter().copied().map(literal_to_i64).collect::<Vec<_>>();
        for row in 0..m {
            for col in 0..n {
                let mut acc = 0_i64;
                for inner in 0..k {
                    acc = acc.wrapping_add(a[row * k + inner].wrapping_mul(b[inner * n + col]));
                }
                elements.push(Literal::I64(acc));
            }
        }
    }

    Ok(Value::from_parts(dtype, geometry.out_shape, elements)?)
}

/// Sum over the axes listed in the `axes` param, or over every axis when absent.
fn eval_reduce_sum(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ReduceSum;
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let in_shape = input.shape();
    let axes = tensor_ops::resolve_reduce_axes(in_shape.rank(), params)?;
    let out_shape = infer::reduced_shape(&in_shape, &axes);
    let dtype = infer::reduce_dtype(input.dtype());

    // Map every input coordinate onto the output by dropping reduced axes.
    let out_strides = row_major_strides(&out_shape.dims);
    let out_len = out_shape.element_count().unwrap_or(0) as usize;
    let mut coords = vec![0_usize; in_shape.rank()];
    let mut targets = Vec::with_capacity(input.literals().len());
    for _ in 0..input.literals().len() {
        let mut flat = 0_usize;
        let mut out_axis = 0_usize;
        for (axis, coord) in coords.iter().enumerate() {
            if axes.contains(&axis) {
                continue;
            }
            flat += coord * out_strides[out_axis];
            out_axis += 1;
        }
        targets.push(flat);
        advance_coords(&mut coords, &in_shape.dims);
    }

    let elements = if dtype.is_float() {
        let mut acc = vec![0.0_f64; out_len];
        for (lit, target) in input.literals().iter().zip(targets.iter()) {
            acc[*target] += literal_to_f64(primitive, *lit)?;
        }
        acc.into_iter().map(Literal::from_f64).collect::<Vec<_>>()
    } else {
        let mut acc = vec![0_i64; out_len];
        for (lit, target) in input.literals().iter().zip(targets.iter()) {
            acc[*target] = acc[*target].wrapping_add(literal_to_i64(*lit));
        }
        acc.into_iter().map(Literal::I64).collect::<Vec<_>>()
    };

    Ok(Value::from_parts(dtype, out_shape, elements)?)
}

#[cfg(test)]
mod tests {
    use super::{EvalError, eval_primitive, infer_aval};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tt_core::{DType, Primitive, Shape, ShapedArray, Value};

    fn no_params() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn matrix(rows: u32, cols: u32, values: &[f64]) -> Value {
        Value::from_f64_slice(DType::F64, Shape::matrix(rows, cols), values)
            .expect("matrix should build")
    }

    #[test]
    fn add_i64_scalars() {
        let out = eval_primitive(
            Primitive::Add,
            &[Value::scalar_i64(2), Value::scalar_i64(5)],
            &no_params(),
        );
        assert_eq!(out, Ok(Value::scalar_i64(7)));
    }

    #[test]
    fn add_vector_and_scalar_broadcasts() {
        let input = Value::vector_i64(&[1, 2, 3]).expect("vector value should build");
        let out = eval_primitive(Primitive::Add, &[input, Value::scalar_i64(2)], &no_params())
            .expect("vector + scalar should succeed");
        assert_eq!(out, Value::vector_i64(&[3, 4, 5]).expect("vector"));
    }

    #[test]
    fn add_broadcasts_row_against_column() {
        let column = matrix(2, 1, &[10.0, 20.0]);
        let row = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("row");
        let out = eval_primitive(Primitive::Add, &[column, row], &no_params())
            .expect("broadcast add should succeed");
        assert_eq!(out.shape(), Shape::matrix(2, 3));
        assert_eq!(
            out.to_f64_vec(),
            Some(vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0])
        );
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = Value::vector_f64(&[1.0, 2.0]).expect("a");
        let b = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("b");
        let err = eval_primitive(Primitive::Sub, &[a, b], &no_params())
            .expect_err("mismatched vectors should fail");
        assert!(matches!(err, EvalError::ShapeMismatch { .. }));
    }

    #[test]
    fn float_scalar_keeps_f32_tensor_dtype() {
        let x = Value::from_f64_slice(DType::F32, Shape::vector(2), &[1.5, 2.5]).expect("x");
        let out = eval_primitive(Primitive::Mul, &[x, Value::scalar_f64(2.0)], &no_params())
            .expect("mul should succeed");
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.to_f64_vec(), Some(vec![3.0, 5.0]));
    }

    #[test]
    fn int_tensor_with_float_scalar_promotes() {
        let x = Value::vector_i64(&[1, 2]).expect("x");
        let out = eval_primitive(Primitive::Add, &[x, Value::scalar_f64(0.5)], &no_params())
            .expect("add should succeed");
        assert_eq!(out.dtype(), DType::F64);
        assert_eq!(out.to_f64_vec(), Some(vec![1.5, 2.5]));
    }

    #[test]
    fn neg_vector_and_bool_rejection() {
        let x = Value::vector_f64(&[1.0, -2.0]).expect("x");
        let out = eval_primitive(Primitive::Neg, &[x], &no_params()).expect("neg");
        assert_eq!(out.to_f64_vec(), Some(vec![-1.0, 2.0]));

        let err = eval_primitive(Primitive::Neg, &[Value::scalar_bool(true)], &no_params())
            .expect_err("bool neg should fail");
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn dot_vector_works() {
        let a = Value::vector_i64(&[1, 2, 3]).expect("a");
        let b = Value::vector_i64(&[4, 5, 6]).expect("b");
        let out = eval_primitive(Primitive::Dot, &[a, b], &no_params()).expect("dot");
        assert_eq!(out, Value::scalar_i64(32));
    }

    #[test]
    fn dot_matrix_matrix() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = matrix(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let out = eval_primitive(Primitive::Dot, &[a, b], &no_params()).expect("matmul");
        assert_eq!(out.shape(), Shape::matrix(2, 2));
        assert_eq!(out.to_f64_vec(), Some(vec![58.0, 64.0, 139.0, 154.0]));
    }

    #[test]
    fn dot_matrix_vector_and_vector_matrix() {
        let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let v = Value::vector_f64(&[1.0, 1.0]).expect("v");
        let mv = eval_primitive(Primitive::Dot, &[a.clone(), v.clone()], &no_params())
            .expect("matvec");
        assert_eq!(mv.to_f64_vec(), Some(vec![3.0, 7.0]));
        let vm = eval_primitive(Primitive::Dot, &[v, a], &no_params()).expect("vecmat");
        assert_eq!(vm.to_f64_vec(), Some(vec![4.0, 6.0]));
    }

    #[test]
    fn dot_inner_dimension_mismatch() {
        let a = matrix(2, 3, &[0.0; 6]);
        let b = matrix(2, 2, &[0.0; 4]);
        let err = eval_primitive(Primitive::Dot, &[a, b], &no_params())
            .expect_err("bad inner dims should fail");
        assert!(matches!(err, EvalError::ShapeMismatch { .. }));
    }

    #[test]
    fn reduce_sum_all_axes_and_single_axis() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let total = eval_primitive(Primitive::ReduceSum, &[a.clone()], &no_params())
            .expect("full reduction");
        assert_eq!(total, Value::scalar_f64(21.0));

        let cols = eval_primitive(Primitive::ReduceSum, &[a.clone()], &params(&[("axes", "0")]))
            .expect("axis 0 reduction");
        assert_eq!(cols.to_f64_vec(), Some(vec![5.0, 7.0, 9.0]));

        let rows = eval_primitive(Primitive::ReduceSum, &[a], &params(&[("axes", "1")]))
            .expect("axis 1 reduction");
        assert_eq!(rows.to_f64_vec(), Some(vec![6.0, 15.0]));
    }

    #[test]
    fn reduce_sum_requires_single_argument() {
        let err = eval_primitive(
            Primitive::ReduceSum,
            &[Value::scalar_i64(1), Value::scalar_i64(2)],
            &no_params(),
        )
        .expect_err("reduce_sum with two args should fail");

        assert_eq!(
            err,
            EvalError::ArityMismatch {
                primitive: Primitive::ReduceSum,
                expected: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn reshape_vector_to_matrix() {
        let v = Value::vector_i64(&[1, 2, 3, 4, 5, 6]).expect("v");
        let out = eval_primitive(Primitive::Reshape, &[v], &params(&[("new_shape", "2,-1")]))
            .expect("reshape");
        assert_eq!(out.shape(), Shape::matrix(2, 3));
    }

    #[test]
    fn transpose_2d() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = eval_primitive(Primitive::Transpose, &[a], &params(&[("permutation", "1,0")]))
            .expect("transpose");
        assert_eq!(out.shape(), Shape::matrix(3, 2));
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
    }

    #[test]
    fn broadcast_in_dim_vector_to_matrix() {
        let v = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("v");
        let out = eval_primitive(
            Primitive::BroadcastInDim,
            &[v],
            &params(&[("shape", "2,3"), ("broadcast_dimensions", "1")]),
        )
        .expect("broadcast");
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]));
    }

    #[test]
    fn inferred_avals_match_evaluated_avals() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = matrix(3, 2, &[1.0; 6]);
        let f32_vec =
            Value::from_f64_slice(DType::F32, Shape::vector(3), &[1.0, 2.0, 3.0]).expect("f32");
        let cases: Vec<(Primitive, Vec<Value>, BTreeMap<String, String>)> = vec![
            (Primitive::Add, vec![a.clone(), Value::scalar_i64(1)], no_params()),
            (Primitive::Mul, vec![f32_vec.clone(), Value::scalar_f64(2.0)], no_params()),
            (Primitive::Dot, vec![a.clone(), b], no_params()),
            (Primitive::ReduceSum, vec![f32_vec.clone()], no_params()),
            (Primitive::ReduceSum, vec![a.clone()], params(&[("axes", "1")])),
            (Primitive::Transpose, vec![a.clone()], params(&[("permutation", "1,0")])),
            (Primitive::Reshape, vec![a.clone()], params(&[("new_shape", "6")])),
            (
                Primitive::BroadcastInDim,
                vec![f32_vec.clone()],
                params(&[("shape", "2,3")]),
            ),
            (
                Primitive::DropoutMask,
                vec![f32_vec, Value::scalar_i64(7)],
                params(&[("prob", "0.5")]),
            ),
            (Primitive::RngFold, vec![Value::scalar_i64(7)], params(&[("salt", "1")])),
        ];

        for (primitive, inputs, params) in cases {
            let value = eval_primitive(primitive, &inputs, &params).expect("eval should succeed");
            let avals = inputs.iter().map(Value::aval).collect::<Vec<_>>();
            let inferred = infer_aval(primitive, &avals, &params).expect("infer should succeed");
            assert_eq!(inferred, value.aval(), "aval mismatch for {}", primitive.as_str());
        }
    }

    #[test]
    fn convert_casts_every_element() {
        let x = Value::vector_f64(&[1.75, -2.5, 0.0]).expect("x");
        let ints = eval_primitive(
            Primitive::ConvertElementType,
            &[x.clone()],
            &params(&[("new_dtype", "i64")]),
        )
        .expect("to i64");
        assert_eq!(ints, Value::vector_i64(&[1, -2, 0]).expect("ints"));

        let narrow = eval_primitive(
            Primitive::ConvertElementType,
            &[x.clone()],
            &params(&[("new_dtype", "f32")]),
        )
        .expect("to f32");
        assert_eq!(narrow.dtype(), DType::F32);
        let inferred = infer_aval(
            Primitive::ConvertElementType,
            &[x.aval()],
            &params(&[("new_dtype", "f32")]),
        )
        .expect("infer");
        assert_eq!(inferred, narrow.aval());

        let err = eval_primitive(
            Primitive::ConvertElementType,
            &[x],
            &params(&[("new_dtype", "f16")]),
        )
        .expect_err("unknown dtype");
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }

    #[test]
    fn inference_rejects_what_evaluation_rejects() {
        let avals = [
            ShapedArray::new(DType::F64, Shape::vector(2)),
            ShapedArray::new(DType::F64, Shape::vector(3)),
        ];
        assert!(infer_aval(Primitive::Add, &avals, &no_params()).is_err());
        assert!(
            infer_aval(Primitive::Neg, &[ShapedArray::scalar(DType::Bool)], &no_params()).is_err()
        );
    }

    fn grid() -> impl Strategy<Value = (u32, u32, Vec<f64>, Vec<f64>)> {
        (1_u32..5, 1_u32..5).prop_flat_map(|(rows, cols)| {
            let halves = |len: usize| {
                proptest::collection::vec(-16_i32..16, len)
                    .prop_map(|ints| ints.into_iter().map(|v| f64::from(v) * 0.5).collect::<Vec<f64>>())
            };
            (
                Just(rows),
                Just(cols),
                halves((rows * cols) as usize),
                halves(cols as usize),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_row_broadcast_matches_elementwise((rows, cols, data, row) in grid()) {
            let lhs = matrix(rows, cols, &data);
            let rhs = Value::vector_f64(&row).expect("row");
            let out = eval_primitive(Primitive::Add, &[lhs.clone(), rhs.clone()], &no_params())
                .expect("broadcast add");

            let expected = data
                .iter()
                .enumerate()
                .map(|(i, v)| v + row[i % cols as usize])
                .collect::<Vec<_>>();
            prop_assert_eq!(out.to_f64_vec(), Some(expected));
            let inferred = infer_aval(Primitive::Add, &[lhs.aval(), rhs.aval()], &no_params())
                .expect("infer");
            prop_assert_eq!(inferred, out.aval());
        }

        #[test]
        fn prop_dropout_mask_is_zero_or_rescaled(
            key in any::<i64>(),
            percent in 0_u32..95,
            len in 1_usize..48,
        ) {
            let prob = f64::from(percent) / 100.0;
            let like = Value::vector_f64(&vec![1.0; len]).expect("like");
            let mask = eval_primitive(
                Primitive::DropoutMask,
                &[like, Value::scalar_i64(key)],
                &params(&[("prob", &prob.to_string())]),
            )
            .expect("mask");
            let scale = 1.0 / (1.0 - prob);
            let values = mask.to_f64_vec().expect("float mask");
            prop_assert_eq!(values.len(), len);
            prop_assert!(values.iter().all(|v| *v == 0.0 || *v == scale));
        }
    }
}
