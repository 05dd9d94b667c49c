//! Image crops to network input tensors

use image::imageops::{self, FilterType};
use image::RgbImage;
use mdnet_common::BoundingBox;
use mdnet_core::{Device, Tensor, INPUT_SIZE};

/// Pixel value subtracted from every channel
pub const PIXEL_MEAN: f32 = 128.0;

/// Crop `bbox` (clamped to the image; whole image when `None`), resize to
/// the network input size and lay out as `(1, 3, H, W)` with the mean removed
pub fn crop_to_tensor(
    image: &RgbImage,
    bbox: Option<&BoundingBox>,
    device: &Device,
) -> mdnet_core::Result<Tensor> {
    let (width, height) = image.dimensions();
    let (x, y, w, h) = match bbox {
        Some(bbox) => clamp_box(bbox, width, height),
        None => (0, 0, width, height),
    };

    let region = imageops::crop_imm(image, x, y, w, h).to_image();
    let size = INPUT_SIZE as u32;
    let resized = imageops::resize(&region, size, size, FilterType::Triangle);

    let plane = INPUT_SIZE * INPUT_SIZE;
    let mut values = vec![0.0f32; 3 * plane];
    for (px, py, pixel) in resized.enumerate_pixels() {
        let offset = py as usize * INPUT_SIZE + px as usize;
        for channel in 0..3 {
            values[channel * plane + offset] = f32::from(pixel[channel]) - PIXEL_MEAN;
        }
    }
    Ok(Tensor::from_vec(values, (1, 3, INPUT_SIZE, INPUT_SIZE), device)?)
}

fn clamp_box(bbox: &BoundingBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x0 = bbox.x.round().clamp(0.0, f64::from(width.saturating_sub(1))) as u32;
    let y0 = bbox.y.round().clamp(0.0, f64::from(height.saturating_sub(1))) as u32;
    let x1 = (bbox.x + bbox.width).round().clamp(f64::from(x0 + 1), f64::from(width)) as u32;
    let y1 = (bbox.y + bbox.height).round().clamp(f64::from(y0 + 1), f64::from(height)) as u32;
    (x0, y0, x1 - x0, y1 - y0)
}
