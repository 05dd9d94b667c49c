//! Native checkpoints (safetensors)
//!
//! The backbone lives under the `shared_layers.` prefix with keys
//! `shared_layers.{stage}.{module_index}.{weight|bias}`. Tensors outside that
//! section (e.g. per-domain branches) are ignored on load.

use crate::error::{NetworkError, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const BACKBONE_PREFIX: &str = "shared_layers.";

/// Safetensors starts with a little-endian u64 header length followed by JSON
pub(crate) fn looks_like_safetensors(head: &[u8]) -> bool {
    if head.len() < 9 {
        return false;
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&head[..8]);
    u64::from_le_bytes(len) > 0 && head[8] == b'{'
}

/// Read the backbone section, keys stripped of [`BACKBONE_PREFIX`]
pub fn read_backbone(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    debug!("Checkpoint {} holds {} tensors", path.display(), tensors.len());

    let mut backbone = HashMap::new();
    for name in tensors.names() {
        let Some(key) = name.strip_prefix(BACKBONE_PREFIX) else {
            continue;
        };
        let view = tensors.tensor(name)?;
        backbone.insert(key.to_string(), to_tensor(name, &view, device)?);
    }

    if backbone.is_empty() {
        return Err(NetworkError::Format(format!(
            "{} has no {} section",
            path.display(),
            BACKBONE_PREFIX.trim_end_matches('.')
        )));
    }
    Ok(backbone)
}

fn to_tensor(name: &str, view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let data = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|b| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(b);
                f64::from_le_bytes(bytes) as f32
            })
            .collect(),
        other => {
            return Err(NetworkError::Format(format!(
                "{name}: unsupported dtype {other:?}"
            )))
        }
    };
    Ok(Tensor::from_vec(values, view.shape(), device)?)
}

/// Write `(key, tensor)` pairs as F32 under [`BACKBONE_PREFIX`]
pub fn write_backbone(path: &Path, tensors: &[(String, &Tensor)]) -> Result<()> {
    let mut encoded: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(tensors.len());
    for (key, tensor) in tensors {
        let values: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        encoded.push((format!("{BACKBONE_PREFIX}{key}"), tensor.dims().to_vec(), bytes));
    }

    let mut views = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    let serialized = safetensors::serialize(views, &None)?;
    std::fs::write(path, serialized)?;
    Ok(())
}
