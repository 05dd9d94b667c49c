//! Fully connected layer and dropout

use super::{dims2, uniform_var};
use crate::error::{NetworkError, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Module as _;
use rand::rngs::StdRng;
use rand::Rng;

/// Affine map with weight `(out, in)` and bias `(out,)`
#[derive(Debug)]
pub struct Linear {
    pub(crate) weight: Var,
    pub(crate) bias: Var,
    inner: candle_nn::Linear,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = uniform_var(&[out_features, in_features], bound, rng, device)?;
        let bias = uniform_var(&[out_features], bound, rng, device)?;
        Ok(Self::from_vars(weight, bias))
    }

    fn from_vars(weight: Var, bias: Var) -> Self {
        let inner = candle_nn::Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Self { weight, bias, inner }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, features) = dims2(x, "linear")?;
        let (out_features, in_features) = self.weight.dims2()?;
        if features != in_features {
            return Err(NetworkError::InvalidArgument(format!(
                "linear expects {in_features} input features, got {features}"
            )));
        }
        if batch == 0 {
            return Ok(Tensor::zeros((0, out_features), DType::F32, x.device())?);
        }
        Ok(self.inner.forward(x)?)
    }
}

/// Inverted dropout; identity outside training mode
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    #[must_use]
    pub fn new(p: f32) -> Self {
        Self {
            p: p.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn probability(&self) -> f32 {
        self.p
    }

    /// Zero each element with probability `p`, scale survivors by `1/(1-p)`
    pub fn forward_train(&self, x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        if self.p <= 0.0 {
            return Ok(x.clone());
        }
        if self.p >= 1.0 {
            return Ok(x.zeros_like()?);
        }
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.random::<f32>() < self.p { 0.0 } else { scale })
            .collect();
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok(x.mul(&mask)?)
    }
}
