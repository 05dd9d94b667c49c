//! Batch normalization over channels, evaluated with running statistics

use super::dims4;
use crate::error::{NetworkError, Result};
use candle_core::{DType, Device, Tensor, Var};

pub const EPS: f64 = 1e-5;

/// Affine per-channel normalization with weight `(C,)` and bias `(C,)`
///
/// Running mean and variance are buffers, not learnable parameters, so they
/// never show up in the registry.
#[derive(Debug)]
pub struct BatchNorm2d {
    pub(crate) weight: Var,
    pub(crate) bias: Var,
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm2d {
    pub fn new(channels: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::ones(channels, DType::F32, device)?,
            bias: Var::zeros(channels, DType::F32, device)?,
            running_mean: Tensor::zeros(channels, DType::F32, device)?,
            running_var: Tensor::ones(channels, DType::F32, device)?,
        })
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = dims4(x, "batch_norm")?;
        if channels != self.channels() {
            return Err(NetworkError::InvalidArgument(format!(
                "batch_norm expects {} channels, got {channels}",
                self.channels()
            )));
        }
        let scale = self
            .weight
            .as_tensor()
            .div(&(self.running_var.affine(1.0, EPS)?.sqrt()?))?;
        let shift = self.bias.as_tensor().sub(&self.running_mean.mul(&scale)?)?;
        let scale = scale.reshape((1, channels, 1, 1))?;
        let shift = shift.reshape((1, channels, 1, 1))?;
        Ok(x.broadcast_mul(&scale)?.broadcast_add(&shift)?)
    }
}
