use tt_cache::CacheKeyError;
use tt_core::{Primitive, ShapedArray, ValueError};
use tt_lax::EvalError;
use tt_runtime::BackendError;
use tt_trace::TraceError;

use crate::tensor::TensorId;

#[derive(Debug, Clone, PartialEq)]
pub enum JitError {
    Eval(EvalError),
    Trace(TraceError),
    Backend(BackendError),
    CacheKey(CacheKeyError),
    Value(ValueError),
    /// Host data was requested from a tensor that only carries an aval.
    AbstractValue { tensor: TensorId },
    /// A host-checked call traced to a different program than the cached one.
    TraceMismatch { expected: String, actual: String },
    OutputArity { expected: usize, actual: usize },
    NotRecording,
    AlreadyRecording,
    /// A trace session is already open on this thread.
    SessionActive,
    InplaceShapeChange {
        expected: ShapedArray,
        actual: ShapedArray,
    },
    UnsupportedGradient {
        primitive: Primitive,
        detail: String,
    },
    InvalidArgument { detail: String },
    Config { detail: String },
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eval(err) => write!(f, "primitive evaluation failed: {err}"),
            Self::Trace(err) => write!(f, "trace construction failed: {err}"),
            Self::Backend(err) => write!(f, "backend failure: {err}"),
            Self::CacheKey(err) => write!(f, "cache key generation failed: {err}"),
            Self::Value(err) => write!(f, "invalid tensor value: {err}"),
            Self::AbstractValue { tensor } => {
                write!(f, "tensor {} is abstract and has no host value", tensor.0)
            }
            Self::TraceMismatch { expected, actual } => {
                write!(
                    f,
                    "host check traced a different program: expected fingerprint {expected}, got {actual}"
                )
            }
            Self::OutputArity { expected, actual } => {
                write!(
                    f,
                    "compiled trace returned {actual} outputs, expected {expected}"
                )
            }
            Self::NotRecording => write!(f, "backward called without an active gradient record"),
            Self::AlreadyRecording => write!(f, "a gradient record is already active on this thread"),
            Self::SessionActive => write!(f, "a trace session is already active on this thread"),
            Self::InplaceShapeChange { expected, actual } => {
                write!(
                    f,
                    "in-place update must keep the aval: expected {}, got {}",
                    expected.signature(),
                    actual.signature()
                )
            }
            Self::UnsupportedGradient { primitive, detail } => {
                write!(f, "no gradient for {}: {detail}", primitive.as_str())
            }
            Self::InvalidArgument { detail } => write!(f, "invalid argument: {detail}"),
            Self::Config { detail } => write!(f, "invalid trace options: {detail}"),
        }
    }
}

impl std::error::Error for JitError {}

impl From<EvalError> for JitError {
    fn from(err: EvalError) -> Self {
        Self::Eval(err)
    }
}

impl From<TraceError> for JitError {
    fn from(err: TraceError) -> Self {
        Self::Trace(err)
    }
}

impl From<BackendError> for JitError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl From<CacheKeyError> for JitError {
    fn from(err: CacheKeyError) -> Self {
        Self::CacheKey(err)
    }
}

impl From<ValueError> for JitError {
    fn from(err: ValueError) -> Self {
        Self::Value(err)
    }
}
