//! Thread-local trace sessions.
//!
//! A session maps live tensors to tracers of a [`SimpleTraceContext`].
//! Explicit arguments are bound first. Any other tensor an op touches is
//! bound on first use: tensors created inside the session become program
//! constants, everything else becomes a capture (an implicit input that is
//! re-read on every compiled call). In-place updates only move a tensor's
//! current tracer; arguments and captures whose tracer moved are emitted
//! as extra program outputs, the writebacks.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tt_core::{ClosedProgram, DType, Primitive, ShapedArray, Value};
use tt_trace::{SimpleTraceContext, TraceAtom, TraceContext, TracerId};

use crate::errors::JitError;
use crate::ops::{Operand, Params};
use crate::tensor::{Storage, Tensor, TensorId};

pub(crate) type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE: RefCell<Option<Session>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    /// Evaluate eagerly and record.
    Record,
    /// Record avals only; host state is left untouched.
    Check,
}

/// Where a writeback output lands after compiled execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritebackTarget {
    Arg(usize),
    Capture(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Arg,
    Capture,
    Rng,
    Const,
    Local,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    kind: BindingKind,
    /// Argument or capture index; unused for other kinds.
    slot: usize,
    initial: TracerId,
    current: TracerId,
}

pub(crate) struct Recorded {
    pub tracer: TracerId,
    pub aval: ShapedArray,
    pub mode: SessionMode,
    pub session: SessionId,
}

struct RngSource {
    state: Tensor,
    tracer: TracerId,
    next_salt: u64,
}

/// Everything dispatch needs to compile and replay one trace.
pub(crate) struct TraceArtifact {
    pub program: ClosedProgram,
    pub user_outputs: usize,
    pub writebacks: Vec<WritebackTarget>,
    pub captures: Vec<Tensor>,
    pub uses_rng: bool,
}

pub(crate) struct Session {
    id: SessionId,
    mode: SessionMode,
    ctx: SimpleTraceContext,
    bindings: FxHashMap<TensorId, Binding>,
    args: Vec<Tensor>,
    arg_tracers: Vec<TracerId>,
    captures: Vec<(Tensor, TracerId)>,
    rng: Option<RngSource>,
    rng_seed: u64,
}

impl Session {
    fn new(mode: SessionMode, rng_seed: u64) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            ctx: SimpleTraceContext::new(),
            bindings: FxHashMap::default(),
            args: Vec::new(),
            arg_tracers: Vec::new(),
            captures: Vec::new(),
            rng: None,
            rng_seed,
        }
    }

    pub(crate) fn mode(&self) -> SessionMode {
        self.mode
    }

    fn bind_args(&mut self, args: &[Tensor]) {
        for (index, arg) in args.iter().enumerate() {
            let tracer = self.ctx.bind_input(arg.aval());
            self.arg_tracers.push(tracer);
            self.args.push(arg.clone());
            // A tensor passed twice is tracked through its first position.
            self.bindings.entry(arg.id()).or_insert(Binding {
                kind: BindingKind::Arg,
                slot: index,
                initial: tracer,
                current: tracer,
            });
        }
    }

    fn tracer_for(&mut self, tensor: &Tensor) -> Result<TracerId, JitError> {
        if let Some(binding) = self.bindings.get(&tensor.id()) {
            return Ok(binding.current);
        }
        let (kind, slot, tracer) = if tensor.origin() == Some(self.id) {
            let tracer = self.ctx.bind_const_value(tensor.value()?);
            (BindingKind::Const, 0, tracer)
        } else {
            let tracer = self.ctx.bind_input(tensor.aval());
            self.captures.push((tensor.clone(), tracer));
            (BindingKind::Capture, self.captures.len() - 1, tracer)
        };
        self.bindings.insert(
            tensor.id(),
            Binding {
                kind,
                slot,
                initial: tracer,
                current: tracer,
            },
        );
        Ok(tracer)
    }

    fn atom_for(&mut self, operand: &Operand) -> Result<TraceAtom, JitError> {
        match operand {
            Operand::Tensor(tensor) => self.tracer_for(tensor).map(TraceAtom::Tracer),
            Operand::Lit(lit) => Ok(TraceAtom::Lit(*lit)),
        }
    }

    pub(crate) fn record(
        &mut self,
        primitive: Primitive,
        inputs: &[Operand],
        params: &Params,
    ) -> Result<Recorded, JitError> {
        let atoms = inputs
            .iter()
            .map(|operand| self.atom_for(operand))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self.ctx.process_primitive(primitive, &atoms, params.clone())?;
        let [tracer] = outputs.as_slice() else {
            return Err(JitError::OutputArity {
                expected: 1,
                actual: outputs.len(),
            });
        };
        let aval = self.ctx.tracer_aval(*tracer)?.clone();
        Ok(Recorded {
            tracer: *tracer,
            aval,
            mode: self.mode,
            session: self.id,
        })
    }

    pub(crate) fn bind_local(&mut self, tensor: &Tensor, tracer: TracerId) {
        self.bindings.insert(
            tensor.id(),
            Binding {
                kind: BindingKind::Local,
                slot: 0,
                initial: tracer,
                current: tracer,
            },
        );
    }

    /// Bind `alias` to whatever `source` currently traces to.
    pub(crate) fn alias(&mut self, source: &Tensor, alias: &Tensor) {
        if let Some(current) = self.bindings.get(&source.id()).map(|b| b.current) {
            self.bind_local(alias, current);
        }
    }

    /// Point `target` at the tracer of `result`.
    pub(crate) fn rebind(&mut self, target: &Tensor, result: &Tensor) -> Result<(), JitError> {
        let tracer = self.tracer_for(result)?;
        self.tracer_for(target)?;
        if let Some(binding) = self.bindings.get_mut(&target.id()) {
            binding.current = tracer;
        }
        Ok(())
    }

    /// The session's RNG state tensor and the salt for the next key drawn
    /// from it. The state is bound as an implicit input on first use.
    pub(crate) fn rng_source(&mut self) -> (Tensor, u64) {
        let source = match self.rng.take() {
            Some(source) => source,
            None => {
                let aval = ShapedArray::scalar(DType::I64);
                let storage = match self.mode {
                    SessionMode::Record => {
                        Storage::Concrete(Value::scalar_i64(self.rng_seed as i64))
                    }
                    SessionMode::Check => Storage::Abstract(aval.clone()),
                };
                let state = Tensor::from_storage(storage, None, false);
                let tracer = self.ctx.bind_input(aval);
                self.bindings.insert(
                    state.id(),
                    Binding {
                        kind: BindingKind::Rng,
                        slot: 0,
                        initial: tracer,
                        current: tracer,
                    },
                );
                RngSource {
                    state,
                    tracer,
                    next_salt: 0,
                }
            }
        };
        let salt = source.next_salt;
        let state = source.state.clone();
        self.rng = Some(RngSource {
            next_salt: salt + 1,
            ..source
        });
        (state, salt)
    }

    fn changed(&self, tensor: &Tensor, kind: BindingKind, slot: usize) -> Option<TracerId> {
        self.bindings
            .get(&tensor.id())
            .filter(|b| b.kind == kind && b.slot == slot && b.current != b.initial)
            .map(|b| b.current)
    }

    fn close(mut self, outputs: &[Tensor]) -> Result<TraceArtifact, JitError> {
        let mut out_tracers = Vec::with_capacity(outputs.len());
        for output in outputs {
            out_tracers.push(self.tracer_for(output)?);
        }

        let mut writebacks = Vec::new();
        for (index, arg) in self.args.iter().enumerate() {
            if let Some(current) = self.changed(arg, BindingKind::Arg, index) {
                writebacks.push(WritebackTarget::Arg(index));
                out_tracers.push(current);
            }
        }
        for (index, (capture, _)) in self.captures.iter().enumerate() {
            if let Some(current) = self.changed(capture, BindingKind::Capture, index) {
                writebacks.push(WritebackTarget::Capture(index));
                out_tracers.push(current);
            }
        }

        let mut inputs = self.arg_tracers.clone();
        inputs.extend(self.captures.iter().map(|(_, initial)| *initial));
        let uses_rng = self.rng.is_some();
        if let Some(source) = &self.rng {
            inputs.push(source.tracer);
        }

        let equation_count = self.ctx.equation_count();
        let program = self.ctx.finalize_with(&inputs, &out_tracers)?;
        log::debug!(
            "trace finished: {equation_count} equations, {} captures, {} writebacks, rng={uses_rng}",
            self.captures.len(),
            writebacks.len()
        );
        Ok(TraceArtifact {
            program,
            user_outputs: outputs.len(),
            writebacks,
            captures: self.captures.into_iter().map(|(capture, _)| capture).collect(),
            uses_rng,
        })
    }
}

/// Run `f` against the session open on this thread, if any.
///
/// `f` must not create tensors through the public constructors or run ops;
/// both consult the active session themselves.
pub(crate) fn with_session<R>(f: impl FnOnce(&mut Session) -> R) -> Option<R> {
    ACTIVE.with(|active| active.borrow_mut().as_mut().map(f))
}

pub(crate) fn active_id() -> Option<SessionId> {
    ACTIVE.with(|active| active.borrow().as_ref().map(|session| session.id))
}

#[must_use]
pub fn is_tracing() -> bool {
    active_id().is_some()
}

/// Keeps a session installed for the duration of a trace. Dropping the
/// guard early (e.g. when the traced function fails) discards the session.
struct SessionGuard {
    id: SessionId,
}

impl SessionGuard {
    fn open(mode: SessionMode, rng_seed: u64) -> Result<Self, JitError> {
        ACTIVE.with(|active| {
            let mut slot = active.borrow_mut();
            if slot.is_some() {
                return Err(JitError::SessionActive);
            }
            let session = Session::new(mode, rng_seed);
            let id = session.id;
            *slot = Some(session);
            Ok(Self { id })
        })
    }

    fn close(self, outputs: &[Tensor]) -> Result<TraceArtifact, JitError> {
        let session = ACTIVE
            .with(|active| active.borrow_mut().take())
            .filter(|session| session.id == self.id)
            .ok_or_else(|| JitError::InvalidArgument {
                detail: "trace session was closed before the traced function returned".to_owned(),
            })?;
        session.close(outputs)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| {
            if let Ok(mut slot) = active.try_borrow_mut() {
                if slot.as_ref().is_some_and(|session| session.id == self.id) {
                    *slot = None;
                }
            }
        });
    }
}

pub(crate) struct Traced {
    pub outputs: Vec<Tensor>,
    pub artifact: TraceArtifact,
}

/// Run `func` under a fresh session and close it into a program.
///
/// In `Record` mode `func` sees the real arguments and mutates them as it
/// would eagerly. In `Check` mode it sees abstract stand-ins that preserve
/// argument aliasing.
pub(crate) fn trace<F>(
    mode: SessionMode,
    func: &mut F,
    args: &[Tensor],
    rng_seed: u64,
) -> Result<Traced, JitError>
where
    F: FnMut(&[Tensor]) -> Result<Vec<Tensor>, JitError>,
{
    let guard = SessionGuard::open(mode, rng_seed)?;
    let call_args = match mode {
        SessionMode::Record => args.to_vec(),
        SessionMode::Check => abstract_stand_ins(args),
    };
    with_session(|session| session.bind_args(&call_args));
    log::debug!("tracing {} arguments in {mode:?} mode", call_args.len());
    let outputs = func(&call_args)?;
    let artifact = guard.close(&outputs)?;
    Ok(Traced { outputs, artifact })
}

fn abstract_stand_ins(args: &[Tensor]) -> Vec<Tensor> {
    let mut seen: FxHashMap<TensorId, Tensor> = FxHashMap::default();
    args.iter()
        .map(|arg| {
            seen.entry(arg.id())
                .or_insert_with(|| Tensor::abstract_of(arg.aval()))
                .clone()
        })
        .collect()
}
