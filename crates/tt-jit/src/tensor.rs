//! Shared tensor handles.
//!
//! A [`Tensor`] is a reference-counted cell. Cloning the handle aliases the
//! same storage, so in-place updates are visible through every clone, the
//! way a caller observes mutation of an argument it passed in.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tt_core::{DType, Literal, Shape, ShapedArray, Value};

use crate::errors::JitError;
use crate::functional;
use crate::ops::Operand;
use crate::session::{self, SessionId, SessionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub u64);

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

fn next_tensor_id() -> TensorId {
    TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Storage {
    Concrete(Value),
    /// Produced while checking a trace: only the aval is known.
    Abstract(ShapedArray),
}

impl Storage {
    fn aval(&self) -> ShapedArray {
        match self {
            Self::Concrete(value) => value.aval(),
            Self::Abstract(aval) => aval.clone(),
        }
    }
}

/// Position of a tensor's producer on a gradient tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub tape: u64,
    pub index: usize,
}

struct TensorCell {
    id: TensorId,
    storage: Storage,
    external: bool,
    grad: Option<Tensor>,
    node: Option<NodeRef>,
    origin: Option<SessionId>,
}

#[derive(Clone)]
pub struct Tensor {
    cell: Rc<RefCell<TensorCell>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.cell.borrow();
        f.debug_struct("Tensor")
            .field("id", &cell.id.0)
            .field("aval", &cell.storage.aval().signature())
            .field("external", &cell.external)
            .field("abstract", &matches!(cell.storage, Storage::Abstract(_)))
            .finish()
    }
}

impl Tensor {
    pub(crate) fn from_storage(storage: Storage, origin: Option<SessionId>, external: bool) -> Self {
        Self {
            cell: Rc::new(RefCell::new(TensorCell {
                id: next_tensor_id(),
                storage,
                external,
                grad: None,
                node: None,
                origin,
            })),
        }
    }

    /// Wrap host data. Inside a trace session the tensor belongs to that
    /// session and is recorded as a program constant when first used.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self::from_storage(Storage::Concrete(value), session::active_id(), false)
    }

    /// Result of compiled execution.
    pub(crate) fn external(value: Value) -> Self {
        Self::from_storage(Storage::Concrete(value), None, true)
    }

    pub(crate) fn abstract_of(aval: ShapedArray) -> Self {
        Self::from_storage(Storage::Abstract(aval), None, false)
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::from_value(Value::scalar_f64(value))
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::from_value(Value::scalar_i64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::from_value(Value::scalar_bool(value))
    }

    /// Float tensor from row-major data. An empty `dims` gives a scalar.
    pub fn from_f64(dtype: DType, dims: &[u32], data: &[f64]) -> Result<Self, JitError> {
        Ok(Self::from_value(Value::from_f64_slice(
            dtype,
            Shape::from(dims),
            data,
        )?))
    }

    pub fn from_i64(dims: &[u32], data: &[i64]) -> Result<Self, JitError> {
        let elements = data.iter().copied().map(Literal::I64).collect();
        Ok(Self::from_value(Value::from_parts(
            DType::I64,
            Shape::from(dims),
            elements,
        )?))
    }

    pub fn zeros(aval: &ShapedArray) -> Result<Self, JitError> {
        Ok(Self::from_value(Value::zeros(aval)?))
    }

    /// Tensor of `aval` with every element set to `fill`.
    pub fn full(aval: &ShapedArray, fill: f64) -> Result<Self, JitError> {
        let count = aval
            .shape
            .element_count()
            .ok_or_else(|| JitError::InvalidArgument {
                detail: format!("shape {:?} overflows", aval.shape.dims),
            })?;
        let elements = vec![Literal::from_f64(fill); count as usize];
        Ok(Self::from_value(Value::from_parts(
            aval.dtype,
            aval.shape.clone(),
            elements,
        )?))
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        self.cell.borrow().id
    }

    #[must_use]
    pub fn aval(&self) -> ShapedArray {
        self.cell.borrow().storage.aval()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.aval().dtype
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        self.aval().shape
    }

    #[must_use]
    pub fn is_abstract(&self) -> bool {
        matches!(self.cell.borrow().storage, Storage::Abstract(_))
    }

    /// Whether this value came out of compiled execution rather than the
    /// eager path.
    #[must_use]
    pub fn is_external_value(&self) -> bool {
        self.cell.borrow().external
    }

    pub fn value(&self) -> Result<Value, JitError> {
        let cell = self.cell.borrow();
        match &cell.storage {
            Storage::Concrete(value) => Ok(value.clone()),
            Storage::Abstract(_) => Err(JitError::AbstractValue { tensor: cell.id }),
        }
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>, JitError> {
        self.value()?
            .to_f64_vec()
            .ok_or_else(|| JitError::InvalidArgument {
                detail: "boolean tensors have no f64 view".to_owned(),
            })
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>, JitError> {
        self.value()?
            .literals()
            .iter()
            .map(|lit| lit.cast(DType::I64).as_i64())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| JitError::InvalidArgument {
                detail: "tensor has no i64 view".to_owned(),
            })
    }

    /// The single element of a one-element tensor.
    pub fn item_f64(&self) -> Result<f64, JitError> {
        match self.to_f64_vec()?.as_slice() {
            [value] => Ok(*value),
            other => Err(JitError::InvalidArgument {
                detail: format!("item() needs one element, tensor has {}", other.len()),
            }),
        }
    }

    #[must_use]
    pub fn grad(&self) -> Option<Tensor> {
        self.cell.borrow().grad.clone()
    }

    pub(crate) fn set_grad(&self, grad: Option<Tensor>) {
        self.cell.borrow_mut().grad = grad;
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn origin(&self) -> Option<SessionId> {
        self.cell.borrow().origin
    }

    pub(crate) fn node(&self) -> Option<NodeRef> {
        self.cell.borrow().node
    }

    pub(crate) fn set_node(&self, node: Option<NodeRef>) {
        self.cell.borrow_mut().node = node;
    }

    /// Tape index of this tensor's producer, if it was produced on `tape`.
    pub(crate) fn node_on(&self, tape: u64) -> Option<usize> {
        self.node()
            .filter(|node| node.tape == tape)
            .map(|node| node.index)
    }

    fn storage(&self) -> Storage {
        self.cell.borrow().storage.clone()
    }

    /// Overwrite with a compiled result and flag the tensor external.
    pub(crate) fn write_external(&self, value: Value) -> Result<(), JitError> {
        let expected = self.aval();
        let actual = value.aval();
        if expected != actual {
            return Err(JitError::InplaceShapeChange { expected, actual });
        }
        let mut cell = self.cell.borrow_mut();
        cell.storage = Storage::Concrete(value);
        cell.external = true;
        Ok(())
    }

    /// Frozen copy of the current contents. Inside a session the copy
    /// aliases this tensor's current tracer, so later in-place updates of
    /// `self` do not leak into it.
    pub(crate) fn snapshot(&self) -> Tensor {
        let snapshot = {
            let cell = self.cell.borrow();
            Self::from_storage(cell.storage.clone(), None, cell.external)
        };
        session::with_session(|session| session.alias(self, &snapshot));
        snapshot
    }

    /// Make `self` take over `result`: same storage (outside a checking
    /// session), same tracer, same tape node. The aval must not change.
    pub(crate) fn rebind_to(&self, result: &Tensor) -> Result<(), JitError> {
        let expected = self.aval();
        let actual = result.aval();
        if expected != actual {
            return Err(JitError::InplaceShapeChange { expected, actual });
        }
        let mode = session::with_session(|session| {
            session.rebind(self, result).map(|()| session.mode())
        })
        .transpose()?;

        let storage = result.storage();
        let node = result.node();
        let mut cell = self.cell.borrow_mut();
        if mode != Some(SessionMode::Check) {
            cell.storage = storage;
            cell.external = false;
        }
        cell.node = node;
        Ok(())
    }

    // ── In-place updates ───────────────────────────────────────────

    pub fn add_(&self, other: &Tensor) -> Result<(), JitError> {
        let result = functional::add(self, other)?;
        self.rebind_to(&result)
    }

    /// `self += value`, with `value` cast to this tensor's dtype.
    pub fn add_scalar_(&self, value: f64) -> Result<(), JitError> {
        let lit = Literal::from_f64(value).cast(self.dtype().canonical_scalar());
        let result = functional::add(self, Operand::Lit(lit))?;
        self.rebind_to(&result)
    }

    /// `self[...] = source`. The source is cast to this tensor's dtype
    /// and broadcast to its shape first.
    pub fn assign_(&self, source: &Tensor) -> Result<(), JitError> {
        let target = self.aval();
        let mut value = source.clone();
        if value.dtype() != target.dtype {
            value = functional::convert(&value, target.dtype)?;
        }
        if value.shape() != target.shape {
            value = functional::broadcast_to(&value, &target.shape.dims)?;
        }
        self.rebind_to(&value)
    }

    pub fn fill_(&self, value: f64) -> Result<(), JitError> {
        let filled = Self::full(&self.aval(), value)?;
        self.rebind_to(&filled)
    }

    // ── Out-of-place shorthands ────────────────────────────────────

    pub fn add(&self, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
        functional::add(self, rhs)
    }

    pub fn sub(&self, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
        functional::sub(self, rhs)
    }

    pub fn mul(&self, rhs: impl Into<Operand>) -> Result<Tensor, JitError> {
        functional::mul(self, rhs)
    }

    pub fn neg(&self) -> Result<Tensor, JitError> {
        functional::neg(self)
    }

    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor, JitError> {
        functional::matmul(self, rhs)
    }

    pub fn sum(&self, axes: Option<&[usize]>) -> Result<Tensor, JitError> {
        functional::sum(self, axes)
    }

    pub fn reshape(&self, new_shape: &[i64]) -> Result<Tensor, JitError> {
        functional::reshape(self, new_shape)
    }

    pub fn transpose(&self, permutation: Option<&[usize]>) -> Result<Tensor, JitError> {
        functional::transpose(self, permutation)
    }
}
