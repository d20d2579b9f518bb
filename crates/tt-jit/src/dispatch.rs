//! Compiled dispatch for traced functions.
//!
//! A [`TracedFunction`] keys compiled executables by the avals of its
//! arguments and by how the argument handles alias each other and the
//! tensors earlier traces captured. A miss traces the function in `Record` mode (so the call
//! still returns eager results) and compiles the program; a hit replays
//! the executable, writes in-place updates back into the affected
//! arguments and captures, and returns tensors flagged as external.

use std::rc::Rc;

use tt_cache::{
    ArgIdentity, CacheKey, CacheStats, ExecutableCache, LruConfig, SignatureKeyInput,
    build_cache_key,
};
use tt_core::Value;
use tt_lax::splitmix64;
use tt_runtime::{BackendRegistry, Executable, default_registry};

use crate::config::{RecompilePolicy, TraceOptions};
use crate::errors::JitError;
use crate::random;
use crate::session::{self, SessionMode, TraceArtifact, WritebackTarget};
use crate::tensor::Tensor;

struct CompiledTrace {
    executable: Box<dyn Executable>,
    user_outputs: usize,
    writebacks: Vec<WritebackTarget>,
    captures: Vec<Tensor>,
    uses_rng: bool,
    fingerprint: String,
}

/// Counters describing how calls were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub compiled_calls: u64,
    pub traces: u64,
    pub eager_calls: u64,
    pub host_checks: u64,
}

pub struct TracedFunction<F> {
    func: F,
    options: TraceOptions,
    registry: BackendRegistry,
    cache: ExecutableCache<Rc<CompiledTrace>>,
    /// Every tensor any compiled trace captured, in first-seen order.
    /// Indices are stable so they can appear in cache keys.
    captured: Vec<Tensor>,
    compiled_once: bool,
    rng_state: Option<u64>,
    stats: DispatchStats,
}

impl<F> std::fmt::Debug for TracedFunction<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedFunction")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .field("cached", &self.cache.len())
            .field("rng_state", &self.rng_state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Trace `func` once for its first signature; any other signature runs
/// eagerly.
pub fn partial_trace<F>(func: F, backend: &str) -> TracedFunction<F>
where
    F: FnMut(&[Tensor]) -> Result<Vec<Tensor>, JitError>,
{
    TracedFunction::new(func, TraceOptions::partial(backend).with_env_overrides())
}

/// Trace and compile `func` for every new signature. With `without_host`
/// cache hits skip re-running the host function.
pub fn xla_trace<F>(without_host: bool, func: F) -> TracedFunction<F>
where
    F: FnMut(&[Tensor]) -> Result<Vec<Tensor>, JitError>,
{
    TracedFunction::new(func, TraceOptions::xla(without_host).with_env_overrides())
}

impl<F> TracedFunction<F>
where
    F: FnMut(&[Tensor]) -> Result<Vec<Tensor>, JitError>,
{
    pub fn new(func: F, options: TraceOptions) -> Self {
        let cache = ExecutableCache::new(LruConfig {
            max_entries: options.cache.max_entries,
        });
        Self {
            func,
            options,
            registry: default_registry(),
            cache,
            captured: Vec::new(),
            compiled_once: false,
            rng_state: None,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Current RNG state fed to the compiled program, once a trace has
    /// used randomness.
    #[must_use]
    pub fn random_seed(&self) -> Option<Tensor> {
        self.rng_state
            .map(|state| Tensor::scalar_i64(state as i64))
    }

    pub fn call(&mut self, args: &[Tensor]) -> Result<Vec<Tensor>, JitError> {
        if session::is_tracing() {
            log::trace!("inlining traced function into the enclosing trace");
            return (self.func)(args);
        }
        if !self.options.enabled {
            self.stats.eager_calls += 1;
            return (self.func)(args);
        }

        let key = build_cache_key(&SignatureKeyInput {
            backend: self.options.backend.clone(),
            policy: self.options.policy.as_str().to_owned(),
            without_host: self.options.without_host,
            compile_options: self.options.compile_options.clone(),
            in_avals: args.iter().map(Tensor::aval).collect(),
            arg_identities: self.arg_identities(args),
        })?;

        if let Some(compiled) = self.cache.get(&key).cloned() {
            log::debug!("cache hit for {key}");
            return self.run_compiled(&compiled, args);
        }
        log::debug!("cache miss for {key}");

        if self.options.policy == RecompilePolicy::FallbackToEager && self.compiled_once {
            log::debug!("no compiled entry for {key}; running eagerly");
            self.stats.eager_calls += 1;
            return (self.func)(args);
        }
        self.trace_and_compile(key, args)
    }

    fn arg_identities(&self, args: &[Tensor]) -> Vec<ArgIdentity> {
        args.iter()
            .enumerate()
            .map(|(index, arg)| {
                if let Some(first) = args[..index].iter().position(|other| other.ptr_eq(arg)) {
                    ArgIdentity::SameAs(first)
                } else if let Some(slot) = self.captured.iter().position(|c| c.ptr_eq(arg)) {
                    ArgIdentity::Capture(slot)
                } else {
                    ArgIdentity::Distinct
                }
            })
            .collect()
    }

    fn trace_and_compile(&mut self, key: CacheKey, args: &[Tensor]) -> Result<Vec<Tensor>, JitError> {
        let seed = self.rng_state.unwrap_or_else(random::trace_seed);
        let traced = session::trace(SessionMode::Record, &mut self.func, args, seed)?;
        self.stats.traces += 1;
        let TraceArtifact {
            program,
            user_outputs,
            writebacks,
            captures,
            uses_rng,
        } = traced.artifact;

        let (backend, fell_back) = self.registry.resolve_with_fallback(&self.options.backend)?;
        let executable = backend.compile(&program)?;
        log::debug!(
            "compiled {key} on '{}'{}: {} inputs, {} outputs",
            executable.backend_name(),
            if fell_back { " (fallback)" } else { "" },
            executable.input_count(),
            executable.output_count()
        );

        for capture in &captures {
            if !self.captured.iter().any(|known| known.ptr_eq(capture)) {
                self.captured.push(capture.clone());
            }
        }
        let compiled = CompiledTrace {
            executable,
            user_outputs,
            writebacks,
            captures,
            uses_rng,
            fingerprint: program.program.canonical_fingerprint().to_owned(),
        };
        self.cache.insert(key, Rc::new(compiled));
        self.compiled_once = true;
        if uses_rng {
            self.rng_state = Some(splitmix64(seed));
        }
        Ok(traced.outputs)
    }

    fn run_compiled(&mut self, compiled: &CompiledTrace, args: &[Tensor]) -> Result<Vec<Tensor>, JitError> {
        let seed = self.rng_state.unwrap_or_else(random::trace_seed);
        if !self.options.without_host {
            let checked = session::trace(SessionMode::Check, &mut self.func, args, seed)?;
            self.stats.host_checks += 1;
            let actual = checked.artifact.program.program.canonical_fingerprint();
            if actual != compiled.fingerprint {
                return Err(JitError::TraceMismatch {
                    expected: compiled.fingerprint.clone(),
                    actual: actual.to_owned(),
                });
            }
        }

        let mut inputs = Vec::with_capacity(args.len() + compiled.captures.len() + 1);
        for tensor in args.iter().chain(&compiled.captures) {
            inputs.push(tensor.value()?);
        }
        if compiled.uses_rng {
            inputs.push(Value::scalar_i64(seed as i64));
        }

        let mut outputs = compiled.executable.execute(&inputs)?;
        let expected = compiled.user_outputs + compiled.writebacks.len();
        if outputs.len() != expected {
            return Err(JitError::OutputArity {
                expected,
                actual: outputs.len(),
            });
        }

        let written = outputs.split_off(compiled.user_outputs);
        for (target, value) in compiled.writebacks.iter().zip(written) {
            let tensor = match *target {
                WritebackTarget::Arg(index) => args.get(index),
                WritebackTarget::Capture(index) => compiled.captures.get(index),
            };
            let tensor = tensor.ok_or_else(|| JitError::InvalidArgument {
                detail: format!("writeback target {target:?} is out of range"),
            })?;
            tensor.write_external(value)?;
        }
        log::trace!(
            "compiled call wrote back {} tensors",
            compiled.writebacks.len()
        );

        if compiled.uses_rng {
            self.rng_state = Some(splitmix64(seed));
        }
        self.stats.compiled_calls += 1;
        Ok(outputs.into_iter().map(Tensor::external).collect())
    }
}
