//! Training loss and evaluation metrics over `(N, 2)` branch scores
//!
//! Column 0 is the background score, column 1 the foreground score.

use crate::error::{NetworkError, Result};
use crate::layers::activation::log_softmax;
use candle_core::{DType, Tensor};
use std::cmp::Ordering;

const EPS: f32 = 1e-8;

/// Row count of a `(N, 2)` score tensor
fn check_scores(scores: &Tensor, which: &str) -> Result<usize> {
    match scores.dims() {
        &[rows, 2] => Ok(rows),
        dims => Err(NetworkError::InvalidArgument(format!(
            "{which} scores must be (N, 2), got {dims:?}"
        ))),
    }
}

fn rows(scores: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(scores.to_dtype(DType::F32)?.to_vec2()?)
}

/// Summed two-class cross-entropy: positives labelled 1, negatives labelled 0
///
/// The result is a scalar tensor on the graph of the scores, ready for
/// `backward`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryLoss;

impl BinaryLoss {
    pub fn compute(&self, pos: &Tensor, neg: &Tensor) -> Result<Tensor> {
        let pos_loss = Self::class_nll(pos, 1, "positive")?;
        let neg_loss = Self::class_nll(neg, 0, "negative")?;
        Ok(pos_loss.add(&neg_loss)?)
    }

    fn class_nll(scores: &Tensor, class: usize, which: &str) -> Result<Tensor> {
        if check_scores(scores, which)? == 0 {
            return Ok(Tensor::zeros((), DType::F32, scores.device())?);
        }
        Ok(log_softmax(scores)?.narrow(1, class, 1)?.sum_all()?.neg()?)
    }
}

/// Fraction of positives scored foreground and negatives scored background
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Accuracy {
    pub fn compute(&self, pos: &Tensor, neg: &Tensor) -> Result<(f32, f32)> {
        let n_pos = check_scores(pos, "positive")?;
        let n_neg = check_scores(neg, "negative")?;
        let pos_correct = rows(pos)?.iter().filter(|r| r[1] > r[0]).count();
        let neg_correct = rows(neg)?.iter().filter(|r| r[0] > r[1]).count();
        let pos_acc = pos_correct as f32 / (n_pos as f32 + EPS);
        let neg_acc = neg_correct as f32 / (n_neg as f32 + EPS);
        Ok((pos_acc, neg_acc))
    }
}

/// Share of positives among the top-`n_pos` foreground scores
#[derive(Debug, Clone, Copy, Default)]
pub struct Precision;

impl Precision {
    pub fn compute(&self, pos: &Tensor, neg: &Tensor) -> Result<f32> {
        let n_pos = check_scores(pos, "positive")?;
        check_scores(neg, "negative")?;

        let mut ranked: Vec<(usize, f32)> = rows(pos)?
            .into_iter()
            .chain(rows(neg)?)
            .map(|row| row[1])
            .enumerate()
            .collect();
        // stable, so ties keep positives first
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let hits = ranked
            .iter()
            .take(n_pos)
            .filter(|(index, _)| *index < n_pos)
            .count();
        Ok(hits as f32 / (n_pos as f32 + EPS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::activation::softmax;
    use candle_core::{Device, Var};

    fn scores(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar().unwrap()
    }

    #[test]
    fn test_metrics_on_mixed_batch() {
        let pos = scores(&[[0.0, 1.0], [1.0, 0.0]]);
        let neg = scores(&[[1.0, 0.0], [0.0, 1.0]]);

        let (pos_acc, neg_acc) = Accuracy.compute(&pos, &neg).unwrap();
        assert!((pos_acc - 0.5).abs() < 1e-6);
        assert!((neg_acc - 0.5).abs() < 1e-6);

        let precision = Precision.compute(&pos, &neg).unwrap();
        assert!((precision - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_accuracy_ties_are_wrong() {
        let tied = scores(&[[0.3, 0.3]]);
        let (pos_acc, neg_acc) = Accuracy.compute(&tied, &tied).unwrap();
        assert_eq!(pos_acc, 0.0);
        assert_eq!(neg_acc, 0.0);
    }

    #[test]
    fn test_loss_non_negative_and_decreasing() {
        let neg = scores(&[[2.0, -1.0]]);
        let mut previous = f32::INFINITY;
        for step in 0..8 {
            let fg = -3.0 + step as f32;
            let pos = scores(&[[0.0, fg]]);
            let loss = scalar(&BinaryLoss.compute(&pos, &neg).unwrap());
            assert!(loss >= 0.0);
            assert!(loss < previous, "step {step}: {loss} !< {previous}");
            previous = loss;
        }
    }

    #[test]
    fn test_loss_closed_form() {
        let zero = scores(&[[0.0, 0.0]]);
        let loss = scalar(&BinaryLoss.compute(&zero, &zero).unwrap());
        assert!((loss - 2.0 * std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_loss_extreme_scores_stay_finite() {
        let pos = scores(&[[500.0, -500.0]]);
        let neg = scores(&[[-500.0, 500.0]]);
        let loss = scalar(&BinaryLoss.compute(&pos, &neg).unwrap());
        assert!(loss.is_finite());
        assert!((loss - 2000.0).abs() < 1e-2);
    }

    #[test]
    fn test_loss_empty_side_contributes_zero() {
        let pos = scores(&[[0.0, 0.0]]);
        let empty = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let loss = scalar(&BinaryLoss.compute(&pos, &empty).unwrap());
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_backward_gives_softmax_minus_onehot() {
        let pos = Var::from_tensor(&scores(&[[0.2, -0.4], [1.0, 0.5]])).unwrap();
        let neg = Var::from_tensor(&scores(&[[-0.3, 0.7]])).unwrap();
        let loss = BinaryLoss.compute(pos.as_tensor(), neg.as_tensor()).unwrap();
        let grads = loss.backward().unwrap();

        let pos_grad: Vec<Vec<f32>> = grads.get(pos.as_tensor()).unwrap().to_vec2().unwrap();
        let neg_grad: Vec<Vec<f32>> = grads.get(neg.as_tensor()).unwrap().to_vec2().unwrap();
        let pos_probs: Vec<Vec<f32>> = softmax(pos.as_tensor()).unwrap().to_vec2().unwrap();
        let neg_probs: Vec<Vec<f32>> = softmax(neg.as_tensor()).unwrap().to_vec2().unwrap();

        for (grad, probs) in pos_grad.iter().zip(&pos_probs) {
            assert!((grad[0] - probs[0]).abs() < 1e-5);
            assert!((grad[1] - (probs[1] - 1.0)).abs() < 1e-5);
        }
        assert!((neg_grad[0][0] - (neg_probs[0][0] - 1.0)).abs() < 1e-5);
        assert!((neg_grad[0][1] - neg_probs[0][1]).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let bad = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let ok = scores(&[[1.0, 2.0]]);
        assert!(BinaryLoss.compute(&bad, &ok).is_err());
        assert!(Accuracy.compute(&ok, &bad).is_err());
        assert!(Precision.compute(&bad, &ok).is_err());
    }
}
