//! Sequence configuration provider
//!
//! Resolves a benchmark-style sequence directory into the inputs a tracking
//! run needs:
//!
//! ```text
//! <dataset_root>/<sequence>/
//! ├── img/                    frames, processed in lexicographic order
//! └── groundtruth_rect.txt    one x,y,w,h row per frame (comma or whitespace separated)
//! ```

use crate::{BoundingBox, CommonError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IMAGE_DIR: &str = "img";
const GROUND_TRUTH_FILE: &str = "groundtruth_rect.txt";
const RESULT_FILE: &str = "result.json";

/// Where figures and results are written, relative to the working directory
#[derive(Debug, Clone)]
pub struct SequenceLayout {
    pub figure_root: PathBuf,
    pub result_root: PathBuf,
}

impl Default for SequenceLayout {
    fn default() -> Self {
        Self {
            figure_root: PathBuf::from("../result_fig"),
            result_root: PathBuf::from("../result"),
        }
    }
}

/// Everything a tracking driver needs to run one sequence
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub image_paths: Vec<PathBuf>,
    pub init_bbox: BoundingBox,
    pub ground_truth: Vec<BoundingBox>,
    /// Figure output directory; `None` when figures are not saved
    pub figure_dir: Option<PathBuf>,
    pub display: bool,
    pub result_path: PathBuf,
}

impl SequenceConfig {
    /// Resolve a sequence with the default output layout
    pub fn load(
        dataset_root: impl AsRef<Path>,
        sequence: &str,
        save_figures: bool,
        display: bool,
    ) -> Result<Self> {
        Self::load_with_layout(
            dataset_root,
            sequence,
            save_figures,
            display,
            &SequenceLayout::default(),
        )
    }

    /// Resolve a sequence, creating the result directory (and the figure
    /// directory when `save_figures` is set)
    pub fn load_with_layout(
        dataset_root: impl AsRef<Path>,
        sequence: &str,
        save_figures: bool,
        display: bool,
        layout: &SequenceLayout,
    ) -> Result<Self> {
        let sequence_dir = dataset_root.as_ref().join(sequence);
        if !sequence_dir.is_dir() {
            return Err(CommonError::SequenceNotFound(
                sequence_dir.display().to_string(),
            ));
        }

        let image_paths = list_images(&sequence_dir.join(IMAGE_DIR))?;
        let ground_truth = read_ground_truth(&sequence_dir.join(GROUND_TRUTH_FILE))?;
        let init_bbox = ground_truth[0];

        let result_dir = layout.result_root.join(sequence);
        std::fs::create_dir_all(&result_dir)?;
        let result_path = result_dir.join(RESULT_FILE);

        let figure_dir = if save_figures {
            let dir = layout.figure_root.join(sequence);
            std::fs::create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };

        info!(
            "Sequence {}: {} frames, {} ground-truth boxes",
            sequence,
            image_paths.len(),
            ground_truth.len()
        );

        Ok(Self {
            image_paths,
            init_bbox,
            ground_truth,
            figure_dir,
            display,
            result_path,
        })
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    debug!("Found {} images in {}", paths.len(), dir.display());
    Ok(paths)
}

/// Parse a ground-truth file; the delimiter is chosen from the first line
pub fn read_ground_truth(path: &Path) -> Result<Vec<BoundingBox>> {
    let contents = std::fs::read_to_string(path)?;
    parse_ground_truth(&contents)
        .and_then(|boxes| {
            if boxes.is_empty() {
                Err(CommonError::EmptyGroundTruth(path.display().to_string()))
            } else {
                Ok(boxes)
            }
        })
}

fn parse_ground_truth(contents: &str) -> Result<Vec<BoundingBox>> {
    let comma_separated = contents
        .lines()
        .next()
        .is_some_and(|line| line.contains(','));

    let mut boxes = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = if comma_separated {
            line.split(',').map(str::trim).collect()
        } else {
            line.split_whitespace().collect()
        };

        if fields.len() != 4 {
            return Err(CommonError::MalformedGroundTruth {
                line: idx + 1,
                reason: format!("expected 4 values, found {}", fields.len()),
            });
        }

        let mut rect = [0.0; 4];
        for (slot, field) in rect.iter_mut().zip(&fields) {
            *slot = field
                .parse::<f64>()
                .map_err(|e| CommonError::MalformedGroundTruth {
                    line: idx + 1,
                    reason: format!("{field:?}: {e}"),
                })?;
        }
        boxes.push(BoundingBox::from_rect(rect));
    }

    Ok(boxes)
}
