//! Spatial featurizers: space-to-depth and the strided conv downsampler.

use candle_core::{ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::error::{Error, Result};

/// Rearrange spatial blocks into the channel axis.
///
/// - Images `[B, C, H, W]` become `[B, H/s, W/s, s*s*C]`.
/// - Videos `[B, T, C, H, W]` become `[B, T/t, H/s, W/s, t*s*s*C]`.
///
/// Channels within a block are ordered `(dt, dh, dw, c)`. The output is
/// channels-last.
pub fn space_to_depth(
    frames: &Tensor,
    temporal_block_size: usize,
    spatial_block_size: usize,
) -> Result<Tensor> {
    let s = spatial_block_size;
    match *frames.dims() {
        [b, c, h, w] => {
            check_divisible("height", h, s)?;
            check_divisible("width", w, s)?;
            Ok(frames
                .reshape(vec![b, c, h / s, s, w / s, s])?
                .permute(vec![0, 2, 4, 3, 5, 1])?
                .contiguous()?
                .reshape((b, h / s, w / s, s * s * c))?)
        }
        [b, t, c, h, w] => {
            let tb = temporal_block_size;
            check_divisible("time", t, tb)?;
            check_divisible("height", h, s)?;
            check_divisible("width", w, s)?;
            Ok(frames
                .reshape(vec![b, t / tb, tb, c, h / s, s, w / s, s])?
                .permute(vec![0, 1, 4, 6, 2, 5, 7, 3])?
                .contiguous()?
                .reshape((b, t / tb, h / s, w / s, tb * s * s * c))?)
        }
        _ => Err(Error::Shape(format!(
            "frames should be of rank 4 (batch, channels, height, width) or rank 5 \
             (batch, time, channels, height, width), got {:?}",
            frames.dims()
        ))),
    }
}

fn check_divisible(axis: &str, extent: usize, block: usize) -> Result<()> {
    if block == 0 || extent % block != 0 {
        return Err(Error::Shape(format!(
            "{axis} {extent} is not divisible by block size {block}"
        )));
    }
    Ok(())
}

/// Zero padding `(before, after)` that makes a stride-1 convolution with
/// kernel `k` preserve the input extent.
pub fn same_padding(kernel_size: usize) -> (usize, usize) {
    let half = kernel_size / 2;
    ((half + kernel_size % 2).saturating_sub(1), half)
}

/// 2D convolution with `padding="same"` semantics.
#[derive(Debug, Clone)]
pub struct Conv2dSamePadding {
    conv: Conv2d,
    padding: (usize, usize),
}

impl Conv2dSamePadding {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv = if bias {
            candle_nn::conv2d(in_channels, out_channels, kernel_size, cfg, vb)?
        } else {
            candle_nn::conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb)?
        };
        Ok(Self {
            conv,
            padding: same_padding(kernel_size),
        })
    }
}

impl Module for Conv2dSamePadding {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (before, after) = self.padding;
        xs.pad_with_zeros(3, before, after)?
            .pad_with_zeros(2, before, after)?
            .apply(&self.conv)
    }
}

#[derive(Debug, Clone)]
struct DownsampleLayer {
    conv: Conv2dSamePadding,
    batchnorm: Option<BatchNorm>,
}

/// Downsamples 4x per layer: a 7x7 stride-2 conv, optional batch norm,
/// ReLU and a 3x3 stride-2 max pool.
#[derive(Debug, Clone)]
pub struct Conv2DDownsample {
    layers: Vec<DownsampleLayer>,
    out_channels: usize,
}

impl Conv2DDownsample {
    pub fn new(
        num_layers: usize,
        in_channels: usize,
        out_channels: usize,
        use_batchnorm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let vb = vb.pp(format!("layers.{i}"));
            let in_channels = if i == 0 { in_channels } else { out_channels };
            let conv = Conv2dSamePadding::new(in_channels, out_channels, 7, 2, false, vb.pp("conv"))?;
            let batchnorm = if use_batchnorm {
                Some(candle_nn::batch_norm(
                    out_channels,
                    BatchNormConfig::default(),
                    vb.pp("batchnorm"),
                )?)
            } else {
                None
            };
            layers.push(DownsampleLayer { conv, batchnorm });
        }
        Ok(Self {
            layers,
            out_channels,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for Conv2DDownsample {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = xs.clone();
        for layer in &self.layers {
            out = out.apply(&layer.conv)?;
            if let Some(bn) = &layer.batchnorm {
                out = bn.forward_t(&out, false)?;
            }
            out = out.relu()?.max_pool2d_with_stride(3, 2)?;
        }
        Ok(out)
    }
}
