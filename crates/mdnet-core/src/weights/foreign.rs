//! MatConvNet model import
//!
//! The model's `layers` cell holds one struct per layer. Entries 0, 4 and 8
//! are the first three convolutions; their `weights` field is a two-element
//! cell `{W (kh, kw, in, out), b (out, 1)}`. Everything else is ignored.

use super::mat::{MatCell, MatFile};
use crate::error::{NetworkError, Result};
use crate::network::Stage;
use candle_core::{Device, Tensor};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::path::Path;

/// Local stages receiving the imported convolutions, in file order
pub const TARGET_STAGES: [Stage; 3] = [Stage::Conv1, Stage::Conv2, Stage::Conv3];
/// Indices of those convolutions in the model's `layers` cell
pub const SOURCE_LAYERS: [usize; 3] = [0, 4, 8];

pub type ConvWeights = (Tensor, Tensor);

pub fn read_conv_weights(path: &Path, device: &Device) -> Result<[ConvWeights; 3]> {
    conv_weights(&MatFile::open(path)?, device)
}

/// Extract and re-layout the three convolutions from a parsed model
pub fn conv_weights(file: &MatFile, device: &Device) -> Result<[ConvWeights; 3]> {
    let layers = file
        .get("layers")
        .ok_or_else(|| NetworkError::Format("model has no `layers` variable".to_string()))?
        .as_cell()
        .ok_or_else(|| NetworkError::Format("`layers` is not a cell array".to_string()))?;

    let needed = SOURCE_LAYERS[2] + 1;
    if layers.len() < needed {
        return Err(NetworkError::Format(format!(
            "model has {} layers, expected at least {needed}",
            layers.len()
        )));
    }

    Ok([
        layer_weights(layers, SOURCE_LAYERS[0], device)?,
        layer_weights(layers, SOURCE_LAYERS[1], device)?,
        layer_weights(layers, SOURCE_LAYERS[2], device)?,
    ])
}

fn layer_weights(layers: &MatCell, index: usize, device: &Device) -> Result<ConvWeights> {
    let format_err = |what: &str| NetworkError::Format(format!("layer {index}: {what}"));

    let layer = layers
        .get(index)
        .and_then(|value| value.as_struct())
        .ok_or_else(|| format_err("not a struct"))?;
    let weights = layer
        .field(0, "weights")
        .and_then(|value| value.as_cell())
        .ok_or_else(|| format_err("missing `weights` cell"))?;
    if weights.len() < 2 {
        return Err(format_err("`weights` must hold a filter and a bias"));
    }

    let filter = weights
        .get(0)
        .and_then(|value| value.as_numeric())
        .ok_or_else(|| format_err("filter is not numeric"))?;
    let bias = weights
        .get(1)
        .and_then(|value| value.as_numeric())
        .ok_or_else(|| format_err("bias is not numeric"))?;

    if filter.ndim() != 4 {
        return Err(format_err(&format!(
            "filter must be (kh, kw, in, out), got {:?}",
            filter.shape()
        )));
    }
    if bias.shape().iter().filter(|&&d| d != 1).count() > 1 {
        return Err(format_err(&format!(
            "bias must be a vector, got {:?}",
            bias.shape()
        )));
    }

    let bias = Tensor::from_vec(bias.iter().copied().collect::<Vec<f32>>(), bias.len(), device)?;
    Ok((to_tensor(&to_local_layout(filter.view()), device)?, bias))
}

/// Copy in logical (row-major) order, whatever the array's memory layout
fn to_tensor(array: &ArrayD<f32>, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(values, array.shape(), device)?)
}

/// `(kh, kw, in, out)` to `(out, in, kh, kw)`, materialised in standard layout
#[must_use]
pub fn to_local_layout(filter: ArrayViewD<'_, f32>) -> ArrayD<f32> {
    filter
        .permuted_axes(IxDyn(&[3, 2, 0, 1]))
        .as_standard_layout()
        .into_owned()
}
