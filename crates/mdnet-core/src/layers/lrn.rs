//! Cross-channel local response normalization
//!
//! `y = x / (K + ALPHA * S)^BETA` where `S` sums the squares of a window of
//! `WINDOW` channels centred on the element's channel. Channels outside
//! `[0, C)` count as zero, so boundary channels see fewer contributors.

use super::dims4;
use crate::error::Result;
use candle_core::Tensor;

pub const WINDOW: usize = 5;
pub const K: f32 = 2.0;
pub const ALPHA: f32 = 1e-4;
pub const BETA: f32 = 0.75;

/// Stateless LRN layer with fixed constants
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResponseNorm;

impl LocalResponseNorm {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = dims4(x, "lrn")?;
        if x.elem_count() == 0 {
            return Ok(x.clone());
        }
        let half = WINDOW / 2;
        // zero channels on both sides, then sum WINDOW shifted views
        let padded = x.sqr()?.pad_with_zeros(1, half, half)?;
        let mut energy = padded.narrow(1, 0, channels)?;
        for offset in 1..WINDOW {
            energy = energy.add(&padded.narrow(1, offset, channels)?)?;
        }
        let denominator = energy
            .affine(f64::from(ALPHA), f64::from(K))?
            .powf(f64::from(BETA))?;
        Ok(x.div(&denominator)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_lrn_preserves_shape() {
        let x = Tensor::ones((2, 7, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = LocalResponseNorm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 7, 3, 4]);
    }

    #[test]
    fn test_lrn_single_channel_closed_form() {
        let input: Vec<f32> = (0..9).map(|i| ((i / 3) as f32 - 1.0) * 10.0 + (i % 3) as f32).collect();
        let x = Tensor::from_vec(input.clone(), (1, 1, 3, 3), &Device::Cpu).unwrap();
        let y = values(&LocalResponseNorm.forward(&x).unwrap());
        for (out, v) in y.iter().zip(input.iter()) {
            let expected = v / (K + ALPHA * v * v).powf(BETA);
            assert!((out - expected).abs() < 1e-6, "{out} vs {expected}");
        }
    }

    #[test]
    fn test_lrn_window_and_boundaries() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let x = Tensor::from_vec(input.to_vec(), (1, 7, 1, 1), &Device::Cpu).unwrap();
        let y = values(&LocalResponseNorm.forward(&x).unwrap());

        let expected = |c: usize| {
            let lo = c.saturating_sub(2);
            let hi = (c + 2).min(6);
            let sum: f32 = input[lo..=hi].iter().map(|v| v * v).sum();
            input[c] / (K + ALPHA * sum).powf(BETA)
        };

        for c in 0..7 {
            assert!((y[c] - expected(c)).abs() < 1e-6, "channel {c}");
        }
    }

    #[test]
    fn test_lrn_is_differentiable() {
        let x = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0, 3.0], &Device::Cpu).unwrap().reshape((1, 3, 1, 1)).unwrap()).unwrap();
        let y = LocalResponseNorm.forward(x.as_tensor()).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let grad = values(grads.get(x.as_tensor()).unwrap());
        assert_eq!(grad.len(), 3);
        // near-identity scaling at these magnitudes
        assert!(grad.iter().all(|g| (g - K.powf(-BETA)).abs() < 1e-2));
    }
}
