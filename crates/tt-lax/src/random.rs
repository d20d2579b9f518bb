//! Counter-based random kernels. Keys are plain i64 scalars, so random
//! streams are values that flow through programs like any other.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tt_core::{DType, Literal, Primitive, ShapedArray, Value};

use crate::{EvalError, check_arity};

/// Weyl increment used by splitmix64, also the salt multiplier for key folding.
pub const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

#[must_use]
pub fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derive the `salt`-th subkey of `key`.
#[must_use]
pub fn fold_key(key: u64, salt: u64) -> u64 {
    splitmix64(key ^ salt.wrapping_mul(GOLDEN_GAMMA))
}

pub(crate) fn parse_salt(params: &BTreeMap<String, String>) -> Result<u64, EvalError> {
    let primitive = Primitive::RngFold;
    let raw = params.get("salt").ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: "missing required param 'salt'".to_owned(),
    })?;
    raw.trim().parse::<u64>().map_err(|_| EvalError::Unsupported {
        primitive,
        detail: format!("invalid salt '{raw}'"),
    })
}

pub(crate) fn parse_prob(params: &BTreeMap<String, String>) -> Result<f64, EvalError> {
    let primitive = Primitive::DropoutMask;
    let raw = params.get("prob").ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: "missing required param 'prob'".to_owned(),
    })?;
    let prob = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| EvalError::Unsupported {
            primitive,
            detail: format!("invalid prob '{raw}'"),
        })?;
    if !(0.0..1.0).contains(&prob) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("prob must be in [0, 1), got {prob}"),
        });
    }
    Ok(prob)
}

pub(crate) fn expect_key_aval(primitive: Primitive, aval: &ShapedArray) -> Result<(), EvalError> {
    if aval.shape.rank() != 0 || aval.dtype.canonical_scalar() != DType::I64 {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "random key must be an i64 scalar",
        });
    }
    Ok(())
}

pub(crate) fn mask_dtype(input: DType) -> DType {
    if input.is_float() { input } else { DType::F64 }
}

fn key_of(primitive: Primitive, value: &Value) -> Result<u64, EvalError> {
    expect_key_aval(primitive, &value.aval())?;
    value
        .as_scalar_literal()
        .and_then(Literal::as_i64)
        .map(|key| key as u64)
        .ok_or(EvalError::TypeMismatch {
            primitive,
            detail: "random key must be an i64 scalar",
        })
}

pub(crate) fn eval_rng_fold(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::RngFold;
    check_arity(primitive, inputs, 1)?;
    let salt = parse_salt(params)?;
    let key = key_of(primitive, &inputs[0])?;
    Ok(Value::scalar_i64(fold_key(key, salt) as i64))
}

/// Keep-mask shaped like the first operand: each element is `0` with
/// probability `prob`, otherwise `1 / (1 - prob)`.
pub(crate) fn eval_dropout_mask(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::DropoutMask;
    check_arity(primitive, inputs, 2)?;
    let prob = parse_prob(params)?;
    let key = key_of(primitive, &inputs[1])?;
    let like = &inputs[0];
    let scale = 1.0 / (1.0 - prob);

    let mut rng = StdRng::seed_from_u64(key);
    let elements = (0..like.literals().len())
        .map(|_| {
            let dropped = rng.gen_bool(prob);
            Literal::from_f64(if dropped { 0.0 } else { scale })
        })
        .collect::<Vec<_>>();

    Ok(Value::from_parts(
        mask_dtype(like.dtype()),
        like.shape(),
        elements,
    )?)
}

#[cfg(test)]
mod tests {
    use super::{fold_key, splitmix64};
    use crate::{EvalError, eval_primitive};
    use std::collections::BTreeMap;
    use tt_core::{Primitive, Shape, Value};

    fn prob(p: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("prob".to_owned(), p.to_owned())])
    }

    #[test]
    fn splitmix_is_deterministic_and_mixing() {
        assert_eq!(splitmix64(0), splitmix64(0));
        assert_ne!(splitmix64(0), splitmix64(1));
        assert_ne!(fold_key(42, 0), fold_key(42, 1));
    }

    #[test]
    fn rng_fold_matches_fold_key() {
        let params = BTreeMap::from([("salt".to_owned(), "3".to_owned())]);
        let out = eval_primitive(Primitive::RngFold, &[Value::scalar_i64(99)], &params)
            .expect("fold should succeed");
        assert_eq!(out, Value::scalar_i64(fold_key(99, 3) as i64));
    }

    #[test]
    fn dropout_mask_is_deterministic_in_key() {
        let x = Value::vector_f64(&[1.0; 64]).expect("x");
        let a = eval_primitive(
            Primitive::DropoutMask,
            &[x.clone(), Value::scalar_i64(5)],
            &prob("0.5"),
        )
        .expect("mask a");
        let b = eval_primitive(
            Primitive::DropoutMask,
            &[x.clone(), Value::scalar_i64(5)],
            &prob("0.5"),
        )
        .expect("mask b");
        let c = eval_primitive(
            Primitive::DropoutMask,
            &[x, Value::scalar_i64(6)],
            &prob("0.5"),
        )
        .expect("mask c");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.shape(), Shape::vector(64));
        let values = a.to_f64_vec().expect("float mask");
        assert!(values.iter().all(|v| *v == 0.0 || *v == 2.0));
    }

    #[test]
    fn dropout_mask_rejects_out_of_range_prob() {
        let x = Value::vector_f64(&[1.0]).expect("x");
        let err = eval_primitive(
            Primitive::DropoutMask,
            &[x, Value::scalar_i64(1)],
            &prob("1.0"),
        )
        .expect_err("prob 1 should fail");
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }

    #[test]
    fn zero_prob_keeps_everything() {
        let x = Value::vector_f64(&[3.0; 8]).expect("x");
        let mask = eval_primitive(
            Primitive::DropoutMask,
            &[x, Value::scalar_i64(11)],
            &prob("0"),
        )
        .expect("mask");
        assert_eq!(mask.to_f64_vec(), Some(vec![1.0; 8]));
    }
}
