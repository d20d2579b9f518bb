//! Stateful modules and their trainable parameters.

use std::ops::Deref;

use tt_core::{DType, ShapedArray, Shape};

use crate::errors::JitError;
use crate::functional;
use crate::tensor::Tensor;

/// A trainable tensor. Clones share the same underlying storage.
#[derive(Debug, Clone)]
pub struct Parameter(Tensor);

impl Parameter {
    #[must_use]
    pub fn new(tensor: Tensor) -> Self {
        Self(tensor)
    }

    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    /// Reset the gradient buffer in place. No-op without one.
    pub fn zero_grad(&self) -> Result<(), JitError> {
        match self.0.grad() {
            Some(grad) => grad.fill_(0.0),
            None => Ok(()),
        }
    }
}

impl Deref for Parameter {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.0
    }
}

impl From<Tensor> for Parameter {
    fn from(tensor: Tensor) -> Self {
        Self(tensor)
    }
}

pub trait Module {
    fn parameters(&self) -> Vec<Parameter>;

    fn forward(&mut self, input: &Tensor) -> Result<Tensor, JitError>;

    fn zero_grad(&self) -> Result<(), JitError> {
        self.parameters().iter().try_for_each(Parameter::zero_grad)
    }
}

/// `y = x @ weight + bias`, with `weight` of shape `[in, out]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
}

impl Linear {
    /// Weight initialised from `U[-1/sqrt(in), 1/sqrt(in))` via the global
    /// generator; bias starts at zero.
    pub fn new(in_features: u32, out_features: u32, bias: bool) -> Result<Self, JitError> {
        if in_features == 0 || out_features == 0 {
            return Err(JitError::InvalidArgument {
                detail: format!("linear layer needs non-zero features, got {in_features}x{out_features}"),
            });
        }
        let bound = 1.0 / f64::from(in_features).sqrt();
        let weight = crate::random::uniform(DType::F32, &[in_features, out_features], -bound, bound)?;
        let bias = if bias {
            Some(Parameter::new(Tensor::zeros(&ShapedArray::new(
                DType::F32,
                Shape::vector(out_features),
            ))?))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(weight),
            bias,
        })
    }

    #[must_use]
    pub fn from_parts(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
        }
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Parameter> {
        std::iter::once(self.weight.clone())
            .chain(self.bias.clone())
            .collect()
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor, JitError> {
        let out = functional::matmul(input, &self.weight)?;
        match &self.bias {
            Some(bias) => functional::add(&out, &**bias),
            None => Ok(out),
        }
    }
}
