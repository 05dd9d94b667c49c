//! Tracking result file
//!
//! One JSON document per sequence: `{"res": [[x, y, w, h], ...], "type":
//! "rect", "fps": <float>}`, indented two spaces.

use crate::{BoundingBox, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Per-sequence tracking output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingResult {
    /// One rounded `[x, y, w, h]` box per frame
    pub res: Vec<[f64; 4]>,
    /// Box encoding, always `"rect"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Frames per second achieved by the tracker
    pub fps: f64,
}

impl TrackingResult {
    /// Build a result from raw per-frame boxes; coordinates are rounded
    #[must_use]
    pub fn new(boxes: &[BoundingBox], fps: f64) -> Self {
        Self {
            res: boxes.iter().map(BoundingBox::rounded).collect(),
            kind: "rect".to_string(),
            fps,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the result file, replacing any existing one
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Wrote {} boxes to {}", self.res.len(), path.display());
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
