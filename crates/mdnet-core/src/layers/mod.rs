//! Leaf layers and the sequential container the backbone is built from
//!
//! Every stage of the network is a [`Sequential`] of [`Module`]s. Module
//! indices inside a stage are stable and appear in native checkpoint keys
//! (`conv1.0.weight`, `fc4.1.bias`). Learnable tensors are candle [`Var`]s,
//! so any loss built from a forward pass can be backpropagated to them.

pub mod activation;
pub mod conv;
pub mod linear;
pub mod lrn;
pub mod norm;

use crate::error::{NetworkError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

pub use conv::{Conv2d, MaxPool2d};
pub use linear::{Dropout, Linear};
pub use lrn::LocalResponseNorm;
pub use norm::BatchNorm2d;

/// Kind of a learnable tensor owned by a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Weight,
    Bias,
}

impl ParamKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Weight => "weight",
            ParamKind::Bias => "bias",
        }
    }
}

#[derive(Debug)]
pub enum Module {
    Conv(Conv2d),
    Relu,
    Lrn(LocalResponseNorm),
    MaxPool(MaxPool2d),
    Dropout(Dropout),
    Linear(Linear),
    BatchNorm(BatchNorm2d),
}

impl Module {
    /// Run the module; `rng` is only consulted by dropout in training mode
    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> Result<Tensor> {
        match self {
            Module::Conv(conv) => conv.forward(x),
            Module::Relu => activation::relu(x),
            Module::Lrn(lrn) => lrn.forward(x),
            Module::MaxPool(pool) => pool.forward(x),
            Module::Dropout(dropout) => match rng {
                Some(rng) => dropout.forward_train(x, rng),
                None => Ok(x.clone()),
            },
            Module::Linear(linear) => linear.forward(x),
            Module::BatchNorm(norm) => norm.forward(x),
        }
    }

    /// Learnable tensors in declaration order (weight before bias)
    #[must_use]
    pub fn parameters(&self) -> Vec<(ParamKind, &Var)> {
        [ParamKind::Weight, ParamKind::Bias]
            .into_iter()
            .filter_map(|kind| Some((kind, self.parameter(kind)?)))
            .collect()
    }

    #[must_use]
    pub fn parameter(&self, kind: ParamKind) -> Option<&Var> {
        match (self, kind) {
            (Module::Conv(conv), ParamKind::Weight) => Some(&conv.weight),
            (Module::Conv(conv), ParamKind::Bias) => Some(&conv.bias),
            (Module::Linear(linear), ParamKind::Weight) => Some(&linear.weight),
            (Module::Linear(linear), ParamKind::Bias) => Some(&linear.bias),
            (Module::BatchNorm(norm), ParamKind::Weight) => Some(&norm.weight),
            (Module::BatchNorm(norm), ParamKind::Bias) => Some(&norm.bias),
            _ => None,
        }
    }

    /// Parameterised normalization layers get a `bn_` infix in registry names
    #[must_use]
    pub fn is_normalization(&self) -> bool {
        matches!(self, Module::BatchNorm(_))
    }
}

/// Ordered container of modules making up one stage or branch
#[derive(Debug, Default)]
pub struct Sequential {
    modules: Vec<Module>,
}

impl Sequential {
    #[must_use]
    pub fn new(modules: Vec<Module>) -> Self {
        Self { modules }
    }

    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> Result<Tensor> {
        let mut x = x.clone();
        for module in &self.modules {
            x = module.forward(&x, rng.as_deref_mut())?;
        }
        Ok(x)
    }

    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    #[must_use]
    pub fn module(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)
    }

    /// `(module_index, kind, var)` for every learnable tensor
    pub fn named_parameters(&self) -> impl Iterator<Item = (usize, ParamKind, &Var)> {
        self.modules.iter().enumerate().flat_map(|(index, module)| {
            module
                .parameters()
                .into_iter()
                .map(move |(kind, var)| (index, kind, var))
        })
    }

    /// Overwrite a parameter in place, keeping its shape
    pub fn set_parameter(&mut self, index: usize, kind: ParamKind, value: &Tensor) -> Result<()> {
        let var = self
            .modules
            .get(index)
            .and_then(|module| module.parameter(kind))
            .ok_or_else(|| {
                NetworkError::InvalidArgument(format!(
                    "module {index} has no {} parameter",
                    kind.as_str()
                ))
            })?;
        if var.dims() != value.dims() {
            return Err(NetworkError::ShapeMismatch {
                name: format!("{index}.{}", kind.as_str()),
                expected: var.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        var.set(&value.to_dtype(var.dtype())?)?;
        Ok(())
    }
}

/// Variable drawn uniformly from `±bound`
pub(crate) fn uniform_var(shape: &[usize], bound: f32, rng: &mut StdRng, device: &Device) -> Result<Var> {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.random_range(-bound..bound)).collect();
    Ok(Var::from_tensor(&Tensor::from_vec(values, shape, device)?)?)
}

pub(crate) fn dims4(x: &Tensor, layer: &str) -> Result<(usize, usize, usize, usize)> {
    x.dims4().map_err(|_| {
        NetworkError::InvalidArgument(format!(
            "{layer} expects a 4-D (N, C, H, W) tensor, got shape {:?}",
            x.dims()
        ))
    })
}

pub(crate) fn dims2(x: &Tensor, layer: &str) -> Result<(usize, usize)> {
    x.dims2().map_err(|_| {
        NetworkError::InvalidArgument(format!(
            "{layer} expects a 2-D (N, features) tensor, got shape {:?}",
            x.dims()
        ))
    })
}

/// Row-major flatten of everything but the batch axis
pub(crate) fn flatten(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let batch = dims.first().copied().unwrap_or(0);
    let features: usize = dims.iter().skip(1).product();
    Ok(x.reshape((batch, features))?)
}
