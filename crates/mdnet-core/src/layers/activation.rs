//! Pointwise activations and row-wise softmax helpers

use crate::error::Result;
use candle_core::Tensor;

#[inline]
pub fn relu(x: &Tensor) -> Result<Tensor> {
    Ok(x.relu()?)
}

/// Numerically stable log-softmax over the class axis (axis 1)
pub fn log_softmax(scores: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::log_softmax(scores, 1)?)
}

/// Softmax over the class axis (axis 1)
pub fn softmax(scores: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax(scores, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_relu() {
        let x = Tensor::new(&[-1.0f32, 0.0, 2.5], &Device::Cpu).unwrap();
        assert_eq!(relu(&x).unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let scores = Tensor::new(&[[1.0f32, 2.0], [-3.0, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let probs: Vec<Vec<f32>> = softmax(&scores).unwrap().to_vec2().unwrap();
        for row in &probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert!((probs[2][0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax_is_stable() {
        let scores = Tensor::new(&[[1000.0f32, 0.0], [-1000.0, 1000.0]], &Device::Cpu).unwrap();
        let logp: Vec<Vec<f32>> = log_softmax(&scores).unwrap().to_vec2().unwrap();
        assert!(logp.iter().flatten().all(|v| v.is_finite() || *v == f32::NEG_INFINITY));
        assert!(logp[0][0].abs() < 1e-6);
        assert!((logp[0][1] + 1000.0).abs() < 1e-3);
    }
}
