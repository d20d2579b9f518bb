//! Single entry point through which every tensor primitive runs.
//!
//! Outside a session the primitive is evaluated eagerly. Inside a `Record`
//! session it is evaluated and recorded; inside a `Check` session it is
//! only recorded and the result carries its inferred aval.

use std::collections::BTreeMap;
use std::fmt::Display;

use tt_core::{Literal, Primitive, Value};
use tt_lax::eval_primitive;

use crate::autodiff;
use crate::errors::JitError;
use crate::session::{self, SessionMode};
use crate::tensor::{Storage, Tensor};

/// Operand of a primitive: a tensor or an inline scalar literal.
#[derive(Debug, Clone)]
pub enum Operand {
    Tensor(Tensor),
    Lit(Literal),
}

impl Operand {
    pub(crate) fn value(&self) -> Result<Value, JitError> {
        match self {
            Self::Tensor(tensor) => tensor.value(),
            Self::Lit(lit) => Ok(Value::Scalar(*lit)),
        }
    }
}

impl From<&Tensor> for Operand {
    fn from(value: &Tensor) -> Self {
        Self::Tensor(value.clone())
    }
}

impl From<Tensor> for Operand {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<Literal> for Operand {
    fn from(value: Literal) -> Self {
        Self::Lit(value)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Lit(Literal::from_f64(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Lit(Literal::I64(value))
    }
}

impl From<i32> for Operand {
    fn from(value: i32) -> Self {
        Self::Lit(Literal::I64(i64::from(value)))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self::Lit(Literal::Bool(value))
    }
}

pub(crate) type Params = BTreeMap<String, String>;

/// Comma-joined list param, e.g. `axes=0,2`. Empty input gives `""`.
pub(crate) fn list_param<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn params<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

pub(crate) fn apply(
    primitive: Primitive,
    inputs: &[Operand],
    params: Params,
) -> Result<Tensor, JitError> {
    let recorded =
        session::with_session(|session| session.record(primitive, inputs, &params)).transpose()?;

    let output = match &recorded {
        Some(rec) if rec.mode == SessionMode::Check => {
            Tensor::from_storage(Storage::Abstract(rec.aval.clone()), Some(rec.session), false)
        }
        _ => {
            let values = inputs
                .iter()
                .map(Operand::value)
                .collect::<Result<Vec<_>, _>>()?;
            let value = eval_primitive(primitive, &values, &params)?;
            Tensor::from_storage(
                Storage::Concrete(value),
                recorded.as_ref().map(|rec| rec.session),
                false,
            )
        }
    };

    if let Some(rec) = &recorded {
        session::with_session(|session| session.bind_local(&output, rec.tracer));
    }
    autodiff::record_op(primitive, inputs, params, &output)?;
    Ok(output)
}
