//! Argument parsers for boxes, layer prefixes and weight file names

use mdnet_common::BoundingBox;
use mdnet_core::WeightFormat;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Empty input")]
    EmptyInput,

    #[error("Expected 4 comma-separated values (x,y,w,h), got {0}")]
    WrongArity(usize),

    #[error("Invalid number: {value:?}")]
    InvalidNumber { value: String },

    #[error("Box must have positive width and height: {input}")]
    EmptyBox { input: String },
}

/// Parse `x,y,w,h`
pub fn parse_bbox(input: &str) -> Result<BoundingBox, ParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    let fields: Vec<&str> = input.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(ParseError::WrongArity(fields.len()));
    }

    let mut rect = [0.0; 4];
    for (slot, field) in rect.iter_mut().zip(&fields) {
        *slot = field.parse().map_err(|_| ParseError::InvalidNumber {
            value: (*field).to_string(),
        })?;
    }

    let bbox = BoundingBox::from_rect(rect);
    if bbox.width <= 0.0 || bbox.height <= 0.0 {
        return Err(ParseError::EmptyBox {
            input: input.to_string(),
        });
    }
    Ok(bbox)
}

/// Split a comma-separated prefix list; blanks are dropped
#[must_use]
pub fn parse_prefixes(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extension hint for weight files; `None` means sniff the content
#[must_use]
pub fn format_from_extension(path: &Path) -> Option<WeightFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mat" => Some(WeightFormat::Foreign),
        "safetensors" => Some(WeightFormat::Native),
        _ => None,
    }
}
