//! Tensor operations. Each builds one or more primitives through the
//! shared dispatch in [`crate::ops`], so the same code runs eagerly,
//! under a recording trace and under a checking trace.

use tt_core::{DType, Primitive};

use crate::errors::JitError;
use crate::ops::{Operand, Params, apply, list_param, params};
use crate::random;
use crate::tensor::Tensor;

pub fn add(lhs: &Tensor, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
    apply(Primitive::Add, &[lhs.into(), rhs.into()], Params::new())
}

pub fn sub(lhs: &Tensor, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
    apply(Primitive::Sub, &[lhs.into(), rhs.into()], Params::new())
}

pub fn mul(lhs: &Tensor, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
    apply(Primitive::Mul, &[lhs.into(), rhs.into()], Params::new())
}

pub fn neg(x: &Tensor) -> Result<Tensor, JitError> {
    apply(Primitive::Neg, &[x.into()], Params::new())
}

/// Matrix product for rank 1 and rank 2 operands.
pub fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, JitError> {
    apply(Primitive::Dot, &[lhs.into(), rhs.into()], Params::new())
}

/// Sum over `axes`, or over every axis when `axes` is `None`.
pub fn sum(x: &Tensor, axes: Option<&[usize]>) -> Result<Tensor, JitError> {
    let params = match axes {
        Some(axes) => params([("axes", list_param(axes))]),
        None => Params::new(),
    };
    apply(Primitive::ReduceSum, &[x.into()], params)
}

/// Reshape to `new_shape`; one entry may be `-1`. An empty shape gives a scalar.
pub fn reshape(x: &Tensor, new_shape: &[i64]) -> Result<Tensor, JitError> {
    apply(
        Primitive::Reshape,
        &[x.into()],
        params([("new_shape", list_param(new_shape))]),
    )
}

/// Permute axes; `None` reverses them.
pub fn transpose(x: &Tensor, permutation: Option<&[usize]>) -> Result<Tensor, JitError> {
    let params = match permutation {
        Some(permutation) => params([("permutation", list_param(permutation))]),
        None => Params::new(),
    };
    apply(Primitive::Transpose, &[x.into()], params)
}

/// Broadcast `x` into `shape`, mapping input axis `i` to output axis
/// `broadcast_dimensions[i]` (trailing axes when `None`).
pub fn broadcast_in_dim(
    x: &Tensor,
    shape: &[u32],
    broadcast_dimensions: Option<&[usize]>,
) -> Result<Tensor, JitError> {
    let mut params = params([("shape", list_param(shape))]);
    if let Some(dims) = broadcast_dimensions {
        params.insert("broadcast_dimensions".to_owned(), list_param(dims));
    }
    apply(Primitive::BroadcastInDim, &[x.into()], params)
}

/// Numpy-style broadcast of `x` to `shape`.
pub fn broadcast_to(x: &Tensor, shape: &[u32]) -> Result<Tensor, JitError> {
    broadcast_in_dim(x, shape, None)
}

/// Elementwise cast to `dtype`. Float to integer truncates toward zero.
pub fn convert(x: &Tensor, dtype: DType) -> Result<Tensor, JitError> {
    apply(
        Primitive::ConvertElementType,
        &[x.into()],
        params([("new_dtype", dtype.as_str().to_owned())]),
    )
}

pub fn zeros_like(x: &Tensor) -> Result<Tensor, JitError> {
    Tensor::zeros(&x.aval())
}

/// Inverted dropout: zero each element with probability `prob` and scale
/// the survivors by `1 / (1 - prob)`.
///
/// Eagerly the mask key is drawn from the global generator. Inside a trace
/// it is folded out of the traced function's RNG state, so compiled calls
/// keep producing fresh masks.
pub fn dropout(x: &Tensor, prob: f64, training: bool) -> Result<Tensor, JitError> {
    if !(0.0..1.0).contains(&prob) {
        return Err(JitError::InvalidArgument {
            detail: format!("dropout probability must be in [0, 1), got {prob}"),
        });
    }
    if !training || prob == 0.0 {
        return Ok(x.clone());
    }
    let key = random::dropout_key()?;
    let mask = apply(
        Primitive::DropoutMask,
        &[x.into(), key.into()],
        params([("prob", prob.to_string())]),
    )?;
    mul(x, &mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tt_core::{DType, Shape};

    fn matrix(rows: u32, cols: u32, data: &[f64]) -> Tensor {
        Tensor::from_f64(DType::F64, &[rows, cols], data).expect("matrix")
    }

    #[test]
    fn matmul_of_matrices() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = matrix(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let c = matmul(&a, &b).expect("matmul");
        assert_eq!(c.shape(), Shape::matrix(2, 2));
        assert_eq!(c.to_f64_vec().expect("f64"), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn scalar_operands_are_weakly_typed() {
        let x = Tensor::from_f64(DType::F32, &[2], &[1.5, 2.5]).expect("tensor");
        let y = add(&x, 1.0).expect("add");
        assert_eq!(y.dtype(), DType::F32);
        let z = sub(&y, 2_i64).expect("sub");
        assert_eq!(z.to_f64_vec().expect("f64"), vec![0.5, 1.5]);
    }

    #[test]
    fn sum_reshape_and_transpose_compose() {
        let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = sum(&a, Some(&[1][..])).expect("row sums");
        assert_eq!(rows.to_f64_vec().expect("f64"), vec![6.0, 15.0]);
        let total = sum(&a, None).expect("total");
        assert_eq!(total.item_f64().expect("item"), 21.0);

        let t = transpose(&a, None).expect("transpose");
        assert_eq!(t.shape(), Shape::matrix(3, 2));
        assert_eq!(
            t.to_f64_vec().expect("f64"),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
        let flat = reshape(&t, &[-1]).expect("reshape");
        assert_eq!(flat.shape(), Shape::vector(6));
    }

    #[test]
    fn broadcast_to_repeats_rows() {
        let row = Tensor::from_f64(DType::F64, &[2], &[1.0, 2.0]).expect("row");
        let tiled = broadcast_to(&row, &[3, 2]).expect("broadcast");
        assert_eq!(
            tiled.to_f64_vec().expect("f64"),
            vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
        );
    }

    #[test]
    fn dropout_is_identity_when_not_training() {
        let x = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let y = dropout(&x, 0.5, false).expect("dropout");
        assert!(y.ptr_eq(&x));
        let y = dropout(&x, 0.0, true).expect("dropout");
        assert!(y.ptr_eq(&x));
    }

    #[test]
    fn dropout_rejects_out_of_range_probability() {
        let x = matrix(1, 1, &[1.0]);
        assert!(matches!(
            dropout(&x, 1.0, true),
            Err(JitError::InvalidArgument { .. })
        ));
        assert!(dropout(&x, -0.1, true).is_err());
    }

    #[test]
    #[serial]
    fn eager_dropout_zeroes_or_scales() {
        random::seed(7);
        let x = Tensor::full(
            &tt_core::ShapedArray::new(DType::F32, Shape::matrix(8, 8)),
            1.0,
        )
        .expect("ones");
        let y = dropout(&x, 0.5, true).expect("dropout");
        let values = y.to_f64_vec().expect("f64");
        assert!(values.iter().all(|v| *v == 0.0 || *v == 2.0));
        assert!(values.iter().any(|v| *v == 0.0));
        assert!(values.iter().any(|v| *v == 2.0));
        assert_eq!(y.dtype(), DType::F32);
    }
}
