//! Common types shared between the network core and tracking drivers
//!
//! Holds the boundary types a tracking loop exchanges with the outside world:
//! bounding boxes, per-sequence configuration and the result file written
//! after a run.

pub mod result;
pub mod sequence;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use result::TrackingResult;
pub use sequence::{SequenceConfig, SequenceLayout};

/// Sequence and result I/O errors
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    #[error("Empty ground truth: {0}")]
    EmptyGroundTruth(String),

    #[error("Malformed ground truth at line {line}: {reason}")]
    MalformedGroundTruth { line: usize, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for sequence and result I/O
pub type Result<T> = std::result::Result<T, CommonError>;

/// Axis-aligned box in pixel coordinates, `(x, y)` is the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from an `[x, y, w, h]` row
    #[must_use]
    pub fn from_rect(rect: [f64; 4]) -> Self {
        Self::new(rect[0], rect[1], rect[2], rect[3])
    }

    #[must_use]
    pub fn to_rect(&self) -> [f64; 4] {
        [self.x, self.y, self.width, self.height]
    }

    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Intersection over union with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Round every coordinate half-to-even, matching the result file convention
    #[must_use]
    pub fn rounded(&self) -> [f64; 4] {
        self.to_rect().map(f64::round_ties_even)
    }
}
