//! 2-D convolution (no padding) and max pooling

use super::{dims4, uniform_var};
use crate::error::{NetworkError, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2dConfig, Module as _};
use rand::rngs::StdRng;

/// Convolution with weight `(out, in, kh, kw)` and bias `(out,)`
#[derive(Debug)]
pub struct Conv2d {
    pub(crate) weight: Var,
    pub(crate) bias: Var,
    inner: candle_nn::Conv2d,
}

impl Conv2d {
    /// Uniform init in `±1/sqrt(fan_in)` for both weight and bias
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel * kernel;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = uniform_var(&[out_channels, in_channels, kernel, kernel], bound, rng, device)?;
        let bias = uniform_var(&[out_channels], bound, rng, device)?;
        let config = Conv2dConfig {
            stride: stride.max(1),
            ..Default::default()
        };
        // shares storage with the vars, so in-place updates are seen here
        let inner = candle_nn::Conv2d::new(
            weight.as_tensor().clone(),
            Some(bias.as_tensor().clone()),
            config,
        );
        Ok(Self { weight, bias, inner })
    }

    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.inner.config().stride
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(x, "conv")?;
        let (out_c, in_c, kh, kw) = self.weight.dims4()?;
        if channels != in_c {
            return Err(NetworkError::InvalidArgument(format!(
                "conv expects {in_c} input channels, got {channels}"
            )));
        }
        if height < kh || width < kw {
            return Err(NetworkError::InvalidArgument(format!(
                "conv kernel {kh}x{kw} larger than input {height}x{width}"
            )));
        }
        if batch == 0 {
            let stride = self.stride();
            let shape = (0, out_c, (height - kh) / stride + 1, (width - kw) / stride + 1);
            return Ok(Tensor::zeros(shape, DType::F32, x.device())?);
        }
        Ok(self.inner.forward(x)?)
    }
}

/// Max pooling with floor output size
///
/// Overlapping windows are gathered with `index_select` and reduced with
/// `maximum`; candle only differentiates `max_pool2d` when kernel equals stride.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    #[must_use]
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self {
            kernel: kernel.max(1),
            stride: stride.max(1),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = dims4(x, "max_pool")?;
        if height < self.kernel || width < self.kernel {
            return Err(NetworkError::InvalidArgument(format!(
                "pool window {} larger than input {height}x{width}",
                self.kernel
            )));
        }
        let out_h = (height - self.kernel) / self.stride + 1;
        let out_w = (width - self.kernel) / self.stride + 1;
        if batch == 0 {
            return Ok(Tensor::zeros((0, channels, out_h, out_w), DType::F32, x.device())?);
        }
        if self.kernel == self.stride {
            return Ok(x.max_pool2d_with_stride(self.kernel, self.stride)?);
        }
        self.windowed_max(&x.contiguous()?, out_h, out_w)
    }

    fn windowed_max(&self, x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
        let device = x.device();
        let mut output: Option<Tensor> = None;
        for dy in 0..self.kernel {
            let rows = x.index_select(&self.offsets(dy, out_h, device)?, 2)?;
            for dx in 0..self.kernel {
                let tap = rows.index_select(&self.offsets(dx, out_w, device)?, 3)?;
                output = Some(match output {
                    Some(acc) => acc.maximum(&tap)?,
                    None => tap,
                });
            }
        }
        output.ok_or_else(|| NetworkError::InvalidArgument("empty pool window".to_string()))
    }

    /// `start, start + stride, ...` as a `u32` index tensor of length `count`
    fn offsets(&self, start: usize, count: usize, device: &Device) -> Result<Tensor> {
        let index: Vec<u32> = (0..count)
            .map(|i| (start + i * self.stride) as u32)
            .collect();
        Ok(Tensor::from_vec(index, count, device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn naive_conv(
        x: &[f32],
        (n, c, h, w): (usize, usize, usize, usize),
        weight: &[f32],
        (oc, kh, kw): (usize, usize, usize),
        bias: &[f32],
        stride: usize,
    ) -> Vec<f32> {
        let oh = (h - kh) / stride + 1;
        let ow = (w - kw) / stride + 1;
        let mut out = Vec::with_capacity(n * oc * oh * ow);
        for b in 0..n {
            for o in 0..oc {
                for y in 0..oh {
                    for xx in 0..ow {
                        let mut acc = bias[o];
                        for i in 0..c {
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let xi = ((b * c + i) * h + y * stride + ky) * w + xx * stride + kx;
                                    let wi = ((o * c + i) * kh + ky) * kw + kx;
                                    acc += x[xi] * weight[wi];
                                }
                            }
                        }
                        out.push(acc);
                    }
                }
            }
        }
        out
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_conv_matches_naive() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = Conv2d::new(3, 5, 3, 2, &mut rng, &Device::Cpu).unwrap();
        let dims = (2, 3, 9, 11);
        let input: Vec<f32> = (0..2 * 3 * 9 * 11)
            .map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5)
            .collect();
        let x = Tensor::from_vec(input.clone(), dims, &Device::Cpu).unwrap();

        let got = conv.forward(&x).unwrap();
        let expected = naive_conv(&input, dims, &values(&conv.weight), (5, 3, 3), &values(&conv.bias), 2);

        assert_eq!(got.dims(), &[2, 5, 4, 5]);
        for (a, b) in values(&got).iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_conv_init_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(96, 256, 5, 2, &mut rng, &Device::Cpu).unwrap();
        let bound = 1.0 / ((96 * 25) as f32).sqrt();
        assert_eq!(conv.weight.dims(), &[256, 96, 5, 5]);
        assert_eq!(conv.stride(), 2);
        assert!(values(&conv.weight).iter().all(|v| v.abs() <= bound));
        assert!(values(&conv.bias).iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(3, 2, 3, 1, &mut rng, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 4, 5, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(conv.forward(&x).is_err());
    }

    #[test]
    fn test_conv_sees_in_place_updates() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(1, 1, 1, 1, &mut rng, &Device::Cpu).unwrap();
        conv.weight.set(&Tensor::full(2.0f32, (1, 1, 1, 1), &Device::Cpu).unwrap()).unwrap();
        conv.bias.set(&Tensor::full(0.5f32, 1, &Device::Cpu).unwrap()).unwrap();
        let x = Tensor::full(3.0f32, (1, 1, 2, 2), &Device::Cpu).unwrap();
        assert_eq!(values(&conv.forward(&x).unwrap()), vec![6.5; 4]);
    }

    #[test]
    fn test_max_pool_floor() {
        let pool = MaxPool2d::new(3, 2);
        let x = Tensor::arange(0f32, 36.0, &Device::Cpu).unwrap().reshape((1, 1, 6, 6)).unwrap();
        let y = pool.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        assert_eq!(values(&y), vec![14.0, 16.0, 26.0, 28.0]);
    }

    #[test]
    fn test_max_pool_windows_match_native_pool() {
        let x = Tensor::arange(0f32, 64.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 8, 8))
            .unwrap()
            .sin()
            .unwrap();
        let pool = MaxPool2d::new(2, 2);
        let composed = pool.windowed_max(&x, 4, 4).unwrap();
        let native = pool.forward(&x).unwrap();
        assert_eq!(values(&composed), values(&native));
    }

    #[test]
    fn test_max_pool_gradient_reaches_window_maxima() {
        let x = Var::from_tensor(
            &Tensor::arange(0f32, 25.0, &Device::Cpu).unwrap().reshape((1, 1, 5, 5)).unwrap(),
        )
        .unwrap();
        let y = MaxPool2d::new(3, 2).forward(x.as_tensor()).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let grad = values(grads.get(x.as_tensor()).unwrap());

        let mut expected = vec![0.0f32; 25];
        for index in [12, 14, 22, 24] {
            expected[index] = 1.0;
        }
        assert_eq!(grad, expected);
    }

    #[test]
    fn test_backbone_spatial_sizes() {
        let pool = MaxPool2d::new(3, 2);
        let x = Tensor::zeros((1, 1, 51, 51), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(pool.forward(&x).unwrap().dims()[2], 25);
        let x = Tensor::zeros((1, 1, 11, 11), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(pool.forward(&x).unwrap().dims()[2], 5);
    }
}
