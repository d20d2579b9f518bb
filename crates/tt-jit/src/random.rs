//! Process-wide random generator and random tensor constructors.
//!
//! Eager random ops draw keys from the global generator. Traced functions
//! do not draw at all: their RNG state starts from [`trace_seed`], which
//! depends only on the last [`seed`] call, so every function traced under
//! the same seed replays the same stream.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tt_core::{DType, Literal, Primitive, Shape, Value};
use tt_lax::splitmix64;

use crate::errors::JitError;
use crate::ops::{Operand, apply, params};
use crate::session;
use crate::tensor::Tensor;

struct GlobalRng {
    seed: u64,
    rng: StdRng,
}

impl GlobalRng {
    fn seeded(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

static GLOBAL_RNG: Mutex<Option<GlobalRng>> = Mutex::new(None);

fn with_global<R>(f: impl FnOnce(&mut GlobalRng) -> R) -> R {
    let mut guard = GLOBAL_RNG.lock().unwrap_or_else(PoisonError::into_inner);
    let state = guard.get_or_insert_with(|| GlobalRng::seeded(rand::random::<u64>()));
    f(state)
}

/// Reseed the global generator.
pub fn seed(seed: u64) {
    log::debug!("global random seed set to {seed}");
    with_global(|global| *global = GlobalRng::seeded(seed));
}

/// Seed of the global generator (drawn from entropy if never set).
#[must_use]
pub fn current_seed() -> u64 {
    with_global(|global| global.seed)
}

/// Draw a fresh 64-bit key from the global generator.
#[must_use]
pub fn next_key() -> u64 {
    with_global(|global| global.rng.next_u64())
}

/// Initial RNG state for a newly traced function.
#[must_use]
pub fn trace_seed() -> u64 {
    splitmix64(current_seed())
}

/// Key operand for one dropout mask: folded out of the session's RNG
/// state when tracing, drawn from the global generator otherwise.
pub(crate) fn dropout_key() -> Result<Operand, JitError> {
    match session::with_session(|session| session.rng_source()) {
        Some((state, salt)) => {
            let key = apply(
                Primitive::RngFold,
                &[Operand::from(state)],
                params([("salt", salt.to_string())]),
            )?;
            Ok(Operand::from(key))
        }
        None => Ok(Operand::Lit(Literal::I64(next_key() as i64))),
    }
}

fn element_count(dims: &[u32]) -> Result<usize, JitError> {
    Shape::from(dims)
        .element_count()
        .map(|count| count as usize)
        .ok_or_else(|| JitError::InvalidArgument {
            detail: format!("shape {dims:?} overflows"),
        })
}

/// Samples from `U[low, high)`, drawn from the global generator.
pub fn uniform(dtype: DType, dims: &[u32], low: f64, high: f64) -> Result<Tensor, JitError> {
    if low.is_nan() || high.is_nan() || low >= high {
        return Err(JitError::InvalidArgument {
            detail: format!("uniform needs low < high, got [{low}, {high})"),
        });
    }
    let count = element_count(dims)?;
    let data = with_global(|global| {
        (0..count)
            .map(|_| global.rng.gen_range(low..high))
            .collect::<Vec<f64>>()
    });
    Ok(Tensor::from_value(Value::from_f64_slice(
        dtype,
        Shape::from(dims),
        &data,
    )?))
}

/// Samples from `N(mean, std^2)` via Box-Muller, drawn from the global generator.
pub fn normal(dtype: DType, dims: &[u32], mean: f64, std: f64) -> Result<Tensor, JitError> {
    let count = element_count(dims)?;
    let data = with_global(|global| {
        (0..count)
            .map(|_| {
                let u1: f64 = global.rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = global.rng.gen_range(0.0..1.0);
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                mean + std * z
            })
            .collect::<Vec<f64>>()
    });
    Ok(Tensor::from_value(Value::from_f64_slice(
        dtype,
        Shape::from(dims),
        &data,
    )?))
}
