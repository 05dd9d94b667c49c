//! Affine spatial transform used for in-network bbox regression
//!
//! A fixed homogeneous grid over `[-1, 1]` is mapped through a per-sample
//! 2x3 transform and the input feature map is bilinearly resampled at the
//! resulting coordinates. `-1` and `+1` address the centres of the first and
//! last pixels; taps outside the input read zero.
//!
//! The sampling weights stay on the autograd graph, so gradients reach both
//! the input and `theta`. Tap positions are integer lookups and are computed
//! off the graph.

use crate::error::{NetworkError, Result};
use crate::layers::dims4;
use candle_core::{DType, Device, Tensor, D};

#[derive(Debug, Clone)]
pub struct AffineSpatialTransform {
    out_height: usize,
    out_width: usize,
    /// Row-major `(3, OH * OW)`: x row, y row, ones row
    grid: Vec<f32>,
}

fn linspace(steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![-1.0],
        n => (0..n)
            .map(|i| -1.0 + 2.0 * i as f32 / (n - 1) as f32)
            .collect(),
    }
}

/// One bilinear corner: flat source index and in-bounds mask per output point
struct Tap {
    index: Vec<u32>,
    inside: Vec<f32>,
}

impl Tap {
    fn new(capacity: usize) -> Self {
        Self {
            index: Vec::with_capacity(capacity),
            inside: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, y: f32, x: f32, height: usize, width: usize) {
        let inside = y >= 0.0 && x >= 0.0 && y < height as f32 && x < width as f32;
        let row = y.clamp(0.0, (height - 1) as f32) as usize;
        let col = x.clamp(0.0, (width - 1) as f32) as usize;
        self.index.push((row * width + col) as u32);
        self.inside.push(if inside { 1.0 } else { 0.0 });
    }
}

impl AffineSpatialTransform {
    #[must_use]
    pub fn new(out_height: usize, out_width: usize) -> Self {
        let points = out_height * out_width;
        let xs = linspace(out_width);
        let ys = linspace(out_height);
        let mut grid = Vec::with_capacity(3 * points);
        grid.extend((0..points).map(|k| xs[k % out_width]));
        grid.extend((0..points).map(|k| ys[k / out_width]));
        grid.extend(std::iter::repeat(1.0).take(points));
        Self {
            out_height,
            out_width,
            grid,
        }
    }

    #[must_use]
    pub fn output_size(&self) -> (usize, usize) {
        (self.out_height, self.out_width)
    }

    #[must_use]
    pub fn grid(&self) -> &[f32] {
        &self.grid
    }

    fn grid_tensor(&self, device: &Device) -> Result<Tensor> {
        let points = self.out_height * self.out_width;
        Ok(Tensor::from_vec(self.grid.clone(), (3, points), device)?)
    }

    /// Resample `input (N, C, H, W)` through `theta (N, 2, 3)` into `(N, C, OH, OW)`
    pub fn warp(&self, input: &Tensor, theta: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(input, "spatial transform")?;
        let (theta_batch, rows, cols) = theta.dims3().map_err(|_| {
            NetworkError::InvalidArgument(format!("theta must be (N, 2, 3), got {:?}", theta.dims()))
        })?;
        if rows != 2 || cols != 3 {
            return Err(NetworkError::InvalidArgument(format!(
                "theta must be (N, 2, 3), got {:?}",
                theta.dims()
            )));
        }
        if theta_batch != batch {
            return Err(NetworkError::InvalidArgument(format!(
                "theta batch {theta_batch} does not match input batch {batch}"
            )));
        }

        let points = self.out_height * self.out_width;
        let output_shape = (batch, channels, self.out_height, self.out_width);
        if input.elem_count() == 0 || points == 0 {
            return Ok(Tensor::zeros(output_shape, DType::F32, input.device())?);
        }
        let device = input.device();

        let grid = self
            .grid_tensor(device)?
            .unsqueeze(0)?
            .broadcast_as((batch, 3, points))?
            .contiguous()?;
        let source = theta.contiguous()?.matmul(&grid)?;
        let x_scale = (width - 1) as f64 / 2.0;
        let y_scale = (height - 1) as f64 / 2.0;
        let ix = source.narrow(1, 0, 1)?.squeeze(1)?.affine(x_scale, x_scale)?;
        let iy = source.narrow(1, 1, 1)?.squeeze(1)?.affine(y_scale, y_scale)?;

        let x0: Vec<f32> = ix.detach().floor()?.flatten_all()?.to_vec1()?;
        let y0: Vec<f32> = iy.detach().floor()?.flatten_all()?.to_vec1()?;
        let mut taps: [Tap; 4] = std::array::from_fn(|_| Tap::new(batch * points));
        for (&x, &y) in x0.iter().zip(y0.iter()) {
            taps[0].push(y, x, height, width);
            taps[1].push(y, x + 1.0, height, width);
            taps[2].push(y + 1.0, x, height, width);
            taps[3].push(y + 1.0, x + 1.0, height, width);
        }

        let fx = ix.sub(&Tensor::from_vec(x0, (batch, points), device)?)?;
        let fy = iy.sub(&Tensor::from_vec(y0, (batch, points), device)?)?;
        let gx = fx.affine(-1.0, 1.0)?;
        let gy = fy.affine(-1.0, 1.0)?;
        let weights = [gy.mul(&gx)?, gy.mul(&fx)?, fy.mul(&gx)?, fy.mul(&fx)?];

        let flat = input.contiguous()?.reshape((batch, channels, height * width))?;
        let mut output = Tensor::zeros((batch, channels, points), DType::F32, device)?;
        for (tap, weight) in taps.into_iter().zip(weights) {
            let index = Tensor::from_vec(tap.index, (batch, 1, points), device)?
                .broadcast_as((batch, channels, points))?
                .contiguous()?;
            let inside = Tensor::from_vec(tap.inside, (batch, points), device)?;
            let weight = weight.mul(&inside)?.unsqueeze(1)?;
            let sampled = flat.gather(&index, D::Minus1)?;
            output = output.add(&sampled.broadcast_mul(&weight)?)?;
        }
        Ok(output.reshape(output_shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{IndexOp, Var};

    fn identity(batch: usize) -> Tensor {
        let rows: Vec<f32> = (0..batch).flat_map(|_| [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).collect();
        Tensor::from_vec(rows, (batch, 2, 3), &Device::Cpu).unwrap()
    }

    fn at(t: &Tensor, (n, c, y, x): (usize, usize, usize, usize)) -> f32 {
        t.i((n, c, y, x)).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_grid_layout() {
        let ast = AffineSpatialTransform::new(2, 3);
        let grid = ast.grid();
        assert_eq!(grid.len(), 18);
        assert_eq!(&grid[0..6], &[-1.0, 0.0, 1.0, -1.0, 0.0, 1.0]);
        assert_eq!(&grid[6..12], &[-1.0, -1.0, -1.0, 1.0, 1.0, 1.0]);
        assert!(grid[12..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_identity_reproduces_input() {
        for (h, w) in [(5, 5), (3, 7), (1, 4), (1, 1)] {
            let count = 2 * 3 * h * w;
            let input: Vec<f32> = (0..count).map(|i| i as f32 * 0.1 - 1.0).collect();
            let x = Tensor::from_vec(input.clone(), (2, 3, h, w), &Device::Cpu).unwrap();
            let ast = AffineSpatialTransform::new(h, w);
            let y = ast.warp(&x, &identity(2)).unwrap();
            assert_eq!(y.dims(), x.dims());
            let got: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
            for (a, b) in got.iter().zip(input.iter()) {
                assert!((a - b).abs() < 1e-4, "{h}x{w}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_translation_zero_fills() {
        let x = Tensor::arange(1f32, 10.0, &Device::Cpu).unwrap().reshape((1, 1, 3, 3)).unwrap();
        // shift the sampling grid one full pixel to the right
        let theta = Tensor::new(&[[[1.0f32, 0.0, 1.0], [0.0, 1.0, 0.0]]], &Device::Cpu).unwrap();
        let y = AffineSpatialTransform::new(3, 3).warp(&x, &theta).unwrap();

        for row in 0..3 {
            assert!((at(&y, (0, 0, row, 0)) - at(&x, (0, 0, row, 1))).abs() < 1e-5);
            assert!((at(&y, (0, 0, row, 1)) - at(&x, (0, 0, row, 2))).abs() < 1e-5);
            assert!(at(&y, (0, 0, row, 2)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_half_pixel_interpolates() {
        let x = Tensor::new(&[[[[0.0f32, 2.0]]]], &Device::Cpu).unwrap();
        // x' = 0 lands halfway between the two columns
        let theta = Tensor::new(&[[[0.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]]], &Device::Cpu).unwrap();
        let y = AffineSpatialTransform::new(1, 1).warp(&x, &theta).unwrap();
        assert!((at(&y, (0, 0, 0, 0)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_theta() {
        let ast = AffineSpatialTransform::new(5, 5);
        let x = Tensor::zeros((2, 1, 5, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(ast.warp(&x, &identity(3)).is_err());
        let theta = Tensor::zeros((2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(ast.warp(&x, &theta).is_err());
    }

    #[test]
    fn test_gradient_reaches_theta() {
        let x = Tensor::new(&[[[[0.0f32, 2.0]]]], &Device::Cpu).unwrap();
        let theta = Var::from_tensor(
            &Tensor::new(&[[[0.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]]], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let y = AffineSpatialTransform::new(1, 1).warp(&x, theta.as_tensor()).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let grad: Vec<f32> = grads
            .get(theta.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // out = 2 * ix and ix = (x' + 1) / 2, where x' = -t00 - t01 + t02
        assert!((grad[2] - 1.0).abs() < 1e-5, "{grad:?}");
        assert!((grad[0] + 1.0).abs() < 1e-5, "{grad:?}");
        assert!((grad[1] + 1.0).abs() < 1e-5, "{grad:?}");
    }
}
