#![forbid(unsafe_code)]

//! Value model and program IR shared by every tensortrace crate.

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    /// Inverse of [`DType::as_str`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f32" => Some(Self::F32),
            "f64" => Some(Self::F64),
            "i32" => Some(Self::I32),
            "i64" => Some(Self::I64),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Result dtype of a binary arithmetic op.
    #[must_use]
    pub fn promote(lhs: Self, rhs: Self) -> Self {
        match (lhs, rhs) {
            (Self::F64, _) | (_, Self::F64) => Self::F64,
            (Self::F32, _) | (_, Self::F32) => Self::F32,
            (Self::I64, _) | (_, Self::I64) => Self::I64,
            (Self::I32, _) | (_, Self::I32) => Self::I32,
            (Self::Bool, Self::Bool) => Self::Bool,
        }
    }

    /// Rank-0 values are stored as bare literals, which only carry the
    /// widest dtype of each kind.
    #[must_use]
    pub fn canonical_scalar(self) -> Self {
        match self {
            Self::F32 => Self::F64,
            Self::I32 => Self::I64,
            other => other,
        }
    }

    #[must_use]
    pub fn zero(self) -> Literal {
        match self {
            Self::F32 | Self::F64 => Literal::from_f64(0.0),
            Self::I32 | Self::I64 => Literal::I64(0),
            Self::Bool => Literal::Bool(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn matrix(rows: u32, cols: u32) -> Self {
        Self {
            dims: vec![rows, cols],
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

impl From<&[u32]> for Shape {
    fn from(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }
}

/// Abstract value of a tensor: everything the tracer knows without data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapedArray {
    pub dtype: DType,
    pub shape: Shape,
}

impl ShapedArray {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            shape: Shape::scalar(),
        }
    }

    /// Same aval with the rank-0 dtype canonicalised to what a scalar value reports.
    #[must_use]
    pub fn canonical(self) -> Self {
        if self.shape.rank() == 0 {
            Self::scalar(self.dtype.canonical_scalar())
        } else {
            self
        }
    }

    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Scalar(lit) => Self::scalar(lit.dtype()),
            Value::Tensor(tensor) => Self {
                dtype: tensor.dtype,
                shape: tensor.shape.clone(),
            },
        }
    }

    /// Compact `dtype[d0,d1,..]` rendering used in cache keys and logs.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut out = String::from(self.dtype.as_str());
        out.push('[');
        for (idx, dim) in self.shape.dims.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            let _ = write!(&mut out, "{dim}");
        }
        out.push(']');
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Neg,
    Dot,
    Transpose,
    ReduceSum,
    Reshape,
    BroadcastInDim,
    ConvertElementType,
    RngFold,
    DropoutMask,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Neg => "neg",
            Self::Dot => "dot",
            Self::Transpose => "transpose",
            Self::ReduceSum => "reduce_sum",
            Self::Reshape => "reshape",
            Self::BroadcastInDim => "broadcast_in_dim",
            Self::ConvertElementType => "convert_element_type",
            Self::RngFold => "rng_fold",
            Self::DropoutMask => "dropout_mask",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_))
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    /// Re-encode this literal for storage under `dtype`.
    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        let float = match self {
            Self::Bool(value) => f64::from(u8::from(value)),
            Self::I64(value) => value as f64,
            Self::F64Bits(bits) => f64::from_bits(bits),
        };
        match dtype {
            DType::F32 => Self::from_f64(f64::from(float as f32)),
            DType::F64 => Self::from_f64(float),
            DType::I32 | DType::I64 => match self {
                Self::I64(value) => Self::I64(value),
                Self::F64Bits(bits) => Self::I64(f64::from_bits(bits) as i64),
                Self::Bool(value) => Self::I64(i64::from(value)),
            },
            DType::Bool => match self {
                Self::Bool(value) => Self::Bool(value),
                Self::I64(value) => Self::Bool(value != 0),
                Self::F64Bits(bits) => Self::Bool(f64::from_bits(bits) != 0.0),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::from_f64_slice(DType::F64, Shape::vector(values.len() as u32), values)
    }

    /// Build a float tensor from row-major data. Rank-0 shapes produce a scalar.
    pub fn from_f64_slice(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, ValueError> {
        if shape.rank() == 0 {
            let [value] = values else {
                return Err(ValueError::ElementCountMismatch {
                    shape,
                    expected_count: 1,
                    actual_count: values.len(),
                });
            };
            return Ok(Self::Scalar(Literal::from_f64(*value).cast(dtype)));
        }
        let elements = values
            .iter()
            .map(|value| Literal::from_f64(*value).cast(dtype))
            .collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(dtype, shape, elements)?))
    }

    /// Assemble a value from row-major elements, casting each to `dtype`.
    /// Rank-0 shapes produce a scalar.
    pub fn from_parts(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        if shape.rank() == 0 {
            let [lit] = elements.as_slice() else {
                return Err(ValueError::ElementCountMismatch {
                    shape,
                    expected_count: 1,
                    actual_count: elements.len(),
                });
            };
            return Ok(Self::Scalar(lit.cast(dtype.canonical_scalar())));
        }
        let elements = elements.into_iter().map(|lit| lit.cast(dtype)).collect();
        Ok(Self::Tensor(TensorValue::new(dtype, shape, elements)?))
    }

    /// Zero-filled value matching `aval`.
    pub fn zeros(aval: &ShapedArray) -> Result<Self, ValueError> {
        if aval.shape.rank() == 0 {
            return Ok(Self::Scalar(aval.dtype.zero()));
        }
        let count = aval
            .shape
            .element_count()
            .ok_or_else(|| ValueError::ShapeOverflow {
                shape: aval.shape.clone(),
            })?;
        Ok(Self::Tensor(TensorValue::new(
            aval.dtype,
            aval.shape.clone(),
            vec![aval.dtype.zero(); count as usize],
        )?))
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    #[must_use]
    pub fn aval(&self) -> ShapedArray {
        ShapedArray::from_value(self)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.dtype(),
            Self::Tensor(tensor) => tensor.dtype,
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(tensor) => tensor.shape.clone(),
        }
    }

    /// Row-major element view; scalars yield a single element.
    #[must_use]
    pub fn literals(&self) -> &[Literal] {
        match self {
            Self::Scalar(lit) => std::slice::from_ref(lit),
            Self::Tensor(tensor) => &tensor.elements,
        }
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.literals().iter().copied().map(Literal::as_f64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count as usize != elements.len() {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: BTreeMap<String, String>,
}

/// A flat, closed-over-nothing dataflow program produced by tracing.
#[derive(Debug, Serialize, Deserialize)]
pub struct Program {
    pub invars: Vec<VarId>,
    pub constvars: Vec<VarId>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
    #[serde(skip)]
    fingerprint_cache: std::sync::OnceLock<String>,
}

impl Clone for Program {
    fn clone(&self) -> Self {
        Self {
            invars: self.invars.clone(),
            constvars: self.constvars.clone(),
            outvars: self.outvars.clone(),
            equations: self.equations.clone(),
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.invars == other.invars
            && self.constvars == other.constvars
            && self.outvars == other.outvars
            && self.equations == other.equations
    }
}

impl Eq for Program {}

impl Program {
    #[must_use]
    pub fn new(
        invars: Vec<VarId>,
        constvars: Vec<VarId>,
        outvars: Vec<VarId>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            outvars,
            equations,
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            write_var_list(&mut out, "in", &self.invars);
            write_var_list(&mut out, "const", &self.constvars);
            write_var_list(&mut out, "out", &self.outvars);

            for eqn in &self.equations {
                let _ = write!(&mut out, "eqn:{}(", eqn.primitive.as_str());
                for atom in &eqn.inputs {
                    write_atom(&mut out, atom);
                    out.push(',');
                }
                out.push(')');
                out.push_str("->");
                for outvar in &eqn.outputs {
                    let _ = write!(&mut out, "v{},", outvar.0);
                }
                out.push('{');
                for (key, value) in &eqn.params {
                    let _ = write!(&mut out, "{key}={value};");
                }
                out.push('}');
                out.push('|');
            }

            out
        })
    }
}

fn write_var_list(out: &mut String, label: &str, vars: &[VarId]) {
    let _ = write!(out, "{label}=[");
    for var in vars {
        let _ = write!(out, "v{},", var.0);
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(var) => {
            let _ = write!(out, "v{}", var.0);
        }
        Atom::Lit(lit) => write_literal(out, *lit),
    }
}

fn write_literal(out: &mut String, lit: Literal) {
    match lit {
        Literal::I64(value) => {
            let _ = write!(out, "i64:{value}");
        }
        Literal::Bool(value) => {
            let _ = write!(out, "bool:{value}");
        }
        Literal::F64Bits(value) => {
            let _ = write!(out, "f64bits:{value}");
        }
    }
}

/// A program together with the values bound to its constvars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedProgram {
    pub program: Program,
    pub const_values: Vec<Value>,
}

impl ClosedProgram {
    #[must_use]
    pub fn new(program: Program, const_values: Vec<Value>) -> Self {
        Self {
            program,
            const_values,
        }
    }

    #[must_use]
    pub fn without_consts(program: Program) -> Self {
        Self {
            program,
            const_values: Vec::new(),
        }
    }
}

/// Small fixed programs used as fixtures across the workspace tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramSpec {
    Add2,
    AddOne,
    Square,
    SquarePlusLinear,
    MatMul,
}

#[must_use]
pub fn build_program(spec: ProgramSpec) -> Program {
    match spec {
        ProgramSpec::Add2 => Program::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(3)],
            vec![binary(Primitive::Add, Atom::Var(VarId(1)), Atom::Var(VarId(2)), 3)],
        ),
        ProgramSpec::AddOne => Program::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![binary(
                Primitive::Add,
                Atom::Var(VarId(1)),
                Atom::Lit(Literal::I64(1)),
                2,
            )],
        ),
        ProgramSpec::Square => Program::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![binary(Primitive::Mul, Atom::Var(VarId(1)), Atom::Var(VarId(1)), 2)],
        ),
        ProgramSpec::SquarePlusLinear => Program::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(4)],
            vec![
                binary(Primitive::Mul, Atom::Var(VarId(1)), Atom::Var(VarId(1)), 2),
                binary(
                    Primitive::Mul,
                    Atom::Var(VarId(1)),
                    Atom::Lit(Literal::I64(2)),
                    3,
                ),
                binary(Primitive::Add, Atom::Var(VarId(2)), Atom::Var(VarId(3)), 4),
            ],
        ),
        ProgramSpec::MatMul => Program::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(3)],
            vec![binary(Primitive::Dot, Atom::Var(VarId(1)), Atom::Var(VarId(2)), 3)],
        ),
    }
}

fn binary(primitive: Primitive, lhs: Atom, rhs: Atom, out: u32) -> Equation {
    Equation {
        primitive,
        inputs: smallvec![lhs, rhs],
        outputs: smallvec![VarId(out)],
        params: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DType, Literal, Program, ProgramSpec, Shape, ShapedArray, TensorValue, Value, ValueError,
        build_program,
    };

    #[test]
    fn shape_scalar_rank_is_zero() {
        let scalar = Shape::scalar();
        assert_eq!(scalar.rank(), 0);
        assert_eq!(scalar.element_count(), Some(1));
    }

    #[test]
    fn vector_constructor_builds_tensor_value() {
        let value = Value::vector_i64(&[1, 2, 3]).expect("vector constructor should succeed");
        let tensor = value.as_tensor().expect("expected tensor value");
        assert_eq!(tensor.shape, Shape::vector(3));
        assert_eq!(tensor.len(), 3);
    }

    #[test]
    fn tensor_new_rejects_wrong_element_count() {
        let err = TensorValue::new(
            DType::I64,
            Shape::vector(4),
            vec![Literal::I64(1), Literal::I64(2)],
        )
        .expect_err("shape mismatch should fail");

        assert!(matches!(err, ValueError::ElementCountMismatch { .. }));
    }

    #[test]
    fn rank_zero_slice_builds_scalar() {
        let value = Value::from_f64_slice(DType::F32, Shape::scalar(), &[2.5])
            .expect("scalar should build");
        assert_eq!(value, Value::scalar_f64(2.5));
        assert!(Value::from_f64_slice(DType::F32, Shape::scalar(), &[1.0, 2.0]).is_err());
    }

    #[test]
    fn from_parts_casts_and_collapses_rank_zero() {
        let value = Value::from_parts(DType::F32, Shape::scalar(), vec![Literal::I64(3)])
            .expect("scalar parts should build");
        assert_eq!(value, Value::scalar_f64(3.0));
        assert_eq!(value.aval(), ShapedArray::new(DType::F32, Shape::scalar()).canonical());

        let tensor = Value::from_parts(
            DType::F64,
            Shape::vector(2),
            vec![Literal::I64(1), Literal::I64(2)],
        )
        .expect("vector parts should build");
        assert_eq!(tensor.to_f64_vec(), Some(vec![1.0, 2.0]));
        assert_eq!(tensor.dtype(), DType::F64);
    }

    #[test]
    fn f32_cast_rounds_to_single_precision() {
        let lit = Literal::from_f64(0.1).cast(DType::F32);
        assert_eq!(lit.as_f64(), Some(f64::from(0.1_f32)));
    }

    #[test]
    fn promotion_prefers_widest_float() {
        assert_eq!(DType::promote(DType::I64, DType::F32), DType::F32);
        assert_eq!(DType::promote(DType::F32, DType::F64), DType::F64);
        assert_eq!(DType::promote(DType::I32, DType::I64), DType::I64);
    }

    #[test]
    fn zeros_matches_aval() {
        let aval = ShapedArray::new(DType::F64, Shape::matrix(2, 3));
        let zeros = Value::zeros(&aval).expect("zeros should build");
        assert_eq!(ShapedArray::from_value(&zeros), aval);
        assert_eq!(zeros.to_f64_vec(), Some(vec![0.0; 6]));
    }

    #[test]
    fn signature_renders_dtype_and_dims() {
        let aval = ShapedArray::new(DType::F32, Shape::from(&[1_u32, 3, 3][..]));
        assert_eq!(aval.signature(), "f32[1,3,3]");
        assert_eq!(ShapedArray::scalar(DType::I64).signature(), "i64[]");
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_programs() {
        let a = build_program(ProgramSpec::Add2);
        let b = build_program(ProgramSpec::Add2);
        let c = build_program(ProgramSpec::AddOne);
        assert_eq!(a.canonical_fingerprint(), b.canonical_fingerprint());
        assert_ne!(a.canonical_fingerprint(), c.canonical_fingerprint());
        assert!(c.canonical_fingerprint().contains("i64:1"));
    }

    #[test]
    fn program_survives_json_round_trip() {
        let program = build_program(ProgramSpec::SquarePlusLinear);
        let json = serde_json::to_string(&program).expect("serialize");
        let restored: Program = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, program);
        assert_eq!(
            restored.canonical_fingerprint(),
            program.canonical_fingerprint()
        );
    }

    mod props {
        use super::super::{DType, Literal, Shape, ShapedArray, Value};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn zeros_have_element_count_of_shape(dims in proptest::collection::vec(1_u32..5, 0..4)) {
                let shape = Shape { dims };
                let aval = ShapedArray::new(DType::F32, shape.clone());
                let zeros = Value::zeros(&aval).expect("zeros should build");
                prop_assert_eq!(zeros.literals().len() as u64, shape.element_count().unwrap_or(0));
                prop_assert_eq!(zeros.aval(), aval.canonical());
            }

            #[test]
            fn f64_cast_is_identity_on_floats(x in -1.0e6_f64..1.0e6) {
                prop_assert_eq!(Literal::from_f64(x).cast(DType::F64).as_f64(), Some(x));
            }
        }
    }
}
