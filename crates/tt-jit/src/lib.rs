#![forbid(unsafe_code)]

//! Tracing JIT for host tensors: eager tensors, trace sessions, compiled
//! dispatch with in-place writebacks, seeded randomness and tape autodiff.

pub mod autodiff;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod functional;
pub mod module;
pub mod ops;
pub mod random;
pub mod session;
pub mod tensor;

pub use autodiff::{GradManager, RecordGuard};
pub use config::{CacheConfig, RecompilePolicy, TraceOptions};
pub use dispatch::{DispatchStats, TracedFunction, partial_trace, xla_trace};
pub use errors::JitError;
pub use module::{Linear, Module, Parameter};
pub use ops::Operand;
pub use session::is_tracing;
pub use tensor::{Tensor, TensorId};
pub use tt_core::{DType, Shape, ShapedArray};
