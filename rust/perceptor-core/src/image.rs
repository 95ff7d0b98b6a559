//! Image and video preprocessing for the Perceiver encoder.
//!
//! Inputs are channels-first: `[B, C, H, W]` for images and
//! `[B, T, C, H, W]` for video. Every featurization produces a
//! channels-last tensor `[B, *index_dims, C]` before the position encoding
//! is attached.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::downsample::{space_to_depth, Conv2DDownsample};
use crate::error::{Error, Result};
use crate::position::{PositionEncoding, PositionEncodingConfig};

/// How raw pixels are turned into input features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum PrepType {
    /// Strided conv + max pool stack, 4x per layer.
    #[default]
    Conv,
    /// Space-to-depth blocks, optionally projected.
    Patches,
    /// Crude strided subsampling of the raw pixels.
    Pixels,
    /// Strided 1x1 convolution.
    Conv1x1,
}

impl FromStr for PrepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conv" => Ok(Self::Conv),
            "patches" => Ok(Self::Patches),
            "pixels" => Ok(Self::Pixels),
            "conv1x1" => Ok(Self::Conv1x1),
            other => Err(Error::InvalidPrepType(other.to_string())),
        }
    }
}

impl TryFrom<String> for PrepType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for PrepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conv => "conv",
            Self::Patches => "patches",
            Self::Pixels => "pixels",
            Self::Conv1x1 => "conv1x1",
        };
        f.write_str(s)
    }
}

/// How the position encoding is merged with the input features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ConcatOrAdd {
    #[default]
    Concat,
    Add,
}

impl FromStr for ConcatOrAdd {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(Self::Concat),
            "add" => Ok(Self::Add),
            other => Err(Error::InvalidConcatOrAdd(other.to_string())),
        }
    }
}

impl TryFrom<String> for ConcatOrAdd {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Image preprocessor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePreprocessorConfig {
    #[serde(default)]
    pub prep_type: PrepType,
    #[serde(default = "default_spatial_downsample")]
    pub spatial_downsample: usize,
    #[serde(default = "default_temporal_downsample")]
    pub temporal_downsample: usize,
    #[serde(default)]
    pub position_encoding: PositionEncodingConfig,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,
    /// Project space-to-depth patches to `out_channels`.
    #[serde(default)]
    pub conv_after_patching: bool,
    #[serde(default = "default_true")]
    pub conv2d_use_batchnorm: bool,
    #[serde(default)]
    pub concat_or_add_pos: ConcatOrAdd,
    /// Project the position encoding to this many channels.
    #[serde(default)]
    pub project_pos_dim: Option<usize>,
}

fn default_spatial_downsample() -> usize {
    4
}
fn default_temporal_downsample() -> usize {
    1
}
fn default_in_channels() -> usize {
    3
}
fn default_out_channels() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for ImagePreprocessorConfig {
    fn default() -> Self {
        Self {
            prep_type: PrepType::default(),
            spatial_downsample: default_spatial_downsample(),
            temporal_downsample: default_temporal_downsample(),
            position_encoding: PositionEncodingConfig::default(),
            in_channels: default_in_channels(),
            out_channels: default_out_channels(),
            conv_after_patching: false,
            conv2d_use_batchnorm: true,
            concat_or_add_pos: ConcatOrAdd::default(),
            project_pos_dim: None,
        }
    }
}

impl ImagePreprocessorConfig {
    /// Channels of the unprojected position encoding when they are fixed by
    /// the config alone.
    ///
    /// A Fourier encoding without `max_resolution` follows the index dims of
    /// the featurized input, which are only known up front for the conv
    /// featurizers. `None` otherwise.
    pub fn position_input_size(&self) -> Option<usize> {
        match &self.position_encoding {
            PositionEncodingConfig::Trainable { num_channels, .. } => Some(*num_channels),
            PositionEncodingConfig::Fourier { max_resolution, .. } if !max_resolution.is_empty() => {
                Some(self.position_encoding.output_size(max_resolution.len()))
            }
            PositionEncodingConfig::Fourier { .. } => match self.prep_type {
                PrepType::Conv | PrepType::Conv1x1 => Some(self.position_encoding.output_size(2)),
                PrepType::Pixels | PrepType::Patches => None,
            },
        }
    }

    /// Number of layers the conv featurizer needs, or `None` when
    /// `spatial_downsample` is not a positive power of 4.
    fn conv_layers(&self) -> Option<usize> {
        let mut remaining = self.spatial_downsample;
        let mut layers = 0;
        while remaining > 1 && remaining % 4 == 0 {
            remaining /= 4;
            layers += 1;
        }
        (remaining == 1 && layers > 0).then_some(layers)
    }
}

enum Featurizer {
    Conv(Conv2DDownsample),
    Conv1x1(Conv2d),
    Pixels,
    Patches(Option<Linear>),
}

/// Turns images or videos into flattened Perceiver inputs with position
/// encodings attached.
pub struct ImagePreprocessor {
    config: ImagePreprocessorConfig,
    featurizer: Featurizer,
    position_encoding: PositionEncoding,
    positions_projection: Option<Linear>,
}

impl ImagePreprocessor {
    pub fn new(config: ImagePreprocessorConfig, vb: VarBuilder) -> Result<Self> {
        if config.spatial_downsample == 0 || config.temporal_downsample == 0 {
            return Err(Error::InvalidConfig(
                "downsampling factors must be > 0".to_string(),
            ));
        }

        let featurizer = match config.prep_type {
            PrepType::Conv => {
                let num_layers = match config.conv_layers() {
                    Some(n) if config.temporal_downsample == 1 => n,
                    _ => {
                        return Err(Error::InvalidConfig(
                            "only powers of 4 expected for spatial and 1 expected for temporal \
                             downsampling with conv"
                                .to_string(),
                        ))
                    }
                };
                Featurizer::Conv(Conv2DDownsample::new(
                    num_layers,
                    config.in_channels,
                    config.out_channels,
                    config.conv2d_use_batchnorm,
                    vb.pp("convnet"),
                )?)
            }
            PrepType::Conv1x1 => {
                if config.temporal_downsample != 1 {
                    return Err(Error::InvalidConfig(
                        "conv1x1 does not downsample in time".to_string(),
                    ));
                }
                let cfg = Conv2dConfig {
                    stride: config.spatial_downsample,
                    ..Default::default()
                };
                Featurizer::Conv1x1(candle_nn::conv2d(
                    config.in_channels,
                    config.out_channels,
                    1,
                    cfg,
                    vb.pp("convnet_1x1"),
                )?)
            }
            PrepType::Pixels => Featurizer::Pixels,
            PrepType::Patches => {
                let projection = if config.conv_after_patching {
                    let s = config.spatial_downsample;
                    let patch_channels = config.temporal_downsample * s * s * config.in_channels;
                    Some(candle_nn::linear(
                        patch_channels,
                        config.out_channels,
                        vb.pp("conv_after_patches"),
                    )?)
                } else {
                    None
                };
                Featurizer::Patches(projection)
            }
        };

        let position_encoding = PositionEncoding::new(&config.position_encoding, vb.pp("position_embeddings"))?;
        let positions_projection = match config.project_pos_dim {
            Some(dim) if dim > 0 => {
                let pos_dim = config.position_input_size().ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "project_pos_dim with {} inputs needs a Fourier max_resolution",
                        config.prep_type
                    ))
                })?;
                Some(candle_nn::linear(pos_dim, dim, vb.pp("positions_projection"))?)
            }
            _ => None,
        };

        Ok(Self {
            config,
            featurizer,
            position_encoding,
            positions_projection,
        })
    }

    pub fn config(&self) -> &ImagePreprocessorConfig {
        &self.config
    }

    /// Number of index dims [`ImagePreprocessor::featurize`] produces for
    /// inputs of shape `input_dims`.
    pub fn feature_index_dims(&self, input_dims: &[usize]) -> Result<usize> {
        let c = &self.config;
        match (c.prep_type, input_dims.len()) {
            (PrepType::Conv | PrepType::Conv1x1 | PrepType::Pixels | PrepType::Patches, 4) => Ok(2),
            (PrepType::Pixels, 5) => Ok(3),
            // a single time block is squeezed away
            (PrepType::Patches, 5) if input_dims[1] / c.temporal_downsample == 1 => Ok(2),
            (PrepType::Patches, 5) => Ok(3),
            (prep_type, _) => Err(Error::Shape(format!(
                "unsupported data format for {prep_type}: {input_dims:?}"
            ))),
        }
    }

    /// Channels of the position encoding after the optional projection.
    pub fn position_channels(&self, input_dims: &[usize]) -> Result<usize> {
        match self.config.project_pos_dim {
            Some(dim) if dim > 0 => Ok(dim),
            _ => Ok(self
                .config
                .position_encoding
                .output_size(self.feature_index_dims(input_dims)?)),
        }
    }

    /// Channels of the featurized input before the position encoding.
    pub fn input_channels(&self, input_dims: &[usize]) -> Result<usize> {
        let c = &self.config;
        self.feature_index_dims(input_dims)?;
        Ok(match c.prep_type {
            PrepType::Conv | PrepType::Conv1x1 => c.out_channels,
            PrepType::Pixels => c.in_channels,
            PrepType::Patches if c.conv_after_patching => c.out_channels,
            PrepType::Patches => {
                let temporal = if input_dims.len() == 5 {
                    c.temporal_downsample
                } else {
                    1
                };
                c.in_channels * c.spatial_downsample * c.spatial_downsample * temporal
            }
        })
    }

    /// Channels of the tensor [`ImagePreprocessor::forward`] returns for
    /// inputs of shape `input_dims`.
    pub fn num_channels(&self, input_dims: &[usize]) -> Result<usize> {
        let pos = self.position_channels(input_dims)?;
        match self.config.concat_or_add_pos {
            ConcatOrAdd::Add => Ok(pos),
            ConcatOrAdd::Concat => Ok(self.input_channels(input_dims)? + pos),
        }
    }

    /// Featurize `inputs`, attach position encodings and return the network
    /// input. `pos` overrides the generated Fourier coordinate grid.
    pub fn forward(
        &self,
        inputs: &Tensor,
        pos: Option<&Tensor>,
        network_input_is_1d: bool,
    ) -> Result<Tensor> {
        let features = self.featurize(inputs)?;
        let (with_pos, _) = self.build_network_inputs(&features, pos, network_input_is_1d)?;
        Ok(with_pos)
    }

    /// Apply the configured featurization; the result is channels-last.
    pub fn featurize(&self, inputs: &Tensor) -> Result<Tensor> {
        let rank = inputs.rank();
        let features = match &self.featurizer {
            Featurizer::Conv(convnet) => {
                expect_rank(inputs, 4, self.config.prep_type)?;
                convnet.forward(inputs)?.permute((0, 2, 3, 1))?
            }
            Featurizer::Conv1x1(conv) => {
                expect_rank(inputs, 4, self.config.prep_type)?;
                conv.forward(inputs)?.permute((0, 2, 3, 1))?
            }
            Featurizer::Pixels => {
                let s = self.config.spatial_downsample;
                match rank {
                    4 => subsample(&subsample(inputs, 2, s)?, 3, s)?.permute((0, 2, 3, 1))?,
                    5 => {
                        let t = self.config.temporal_downsample;
                        subsample(&subsample(&subsample(inputs, 1, t)?, 3, s)?, 4, s)?
                            .permute((0, 1, 3, 4, 2))?
                    }
                    _ => {
                        return Err(Error::Shape(format!(
                            "unsupported data format for pixels: rank {rank}"
                        )))
                    }
                }
            }
            Featurizer::Patches(projection) => {
                let mut patches = space_to_depth(
                    inputs,
                    self.config.temporal_downsample,
                    self.config.spatial_downsample,
                )?;
                if patches.rank() == 5 && patches.dim(1)? == 1 {
                    // single time step, e.g. optical flow
                    patches = patches.squeeze(1)?;
                }
                match projection {
                    Some(linear) => linear.forward(&patches)?,
                    None => patches,
                }
            }
        };
        debug!(prep_type = %self.config.prep_type, features = ?features.dims(), "featurized");
        Ok(features.contiguous()?)
    }

    /// Construct the final input, including position encoding.
    ///
    /// `inputs` is channels-last `[B, *index_dims, C]`. Returns the inputs
    /// with and without the position encoding; both are flattened to
    /// `[B, N, C]` when `network_input_is_1d`.
    pub fn build_network_inputs(
        &self,
        inputs: &Tensor,
        pos: Option<&Tensor>,
        network_input_is_1d: bool,
    ) -> Result<(Tensor, Tensor)> {
        let dims = inputs.dims().to_vec();
        if dims.len() < 3 {
            return Err(Error::Shape(format!(
                "expected [batch, *index_dims, channels], got {dims:?}"
            )));
        }
        let batch_size = dims[0];
        let channels = dims[dims.len() - 1];
        let index_dims = &dims[1..dims.len() - 1];
        let indices: usize = index_dims.iter().product();

        let inputs = if dims.len() > 3 && network_input_is_1d {
            inputs.reshape((batch_size, indices, channels))?
        } else {
            inputs.clone()
        };

        let device: &Device = inputs.device();
        let mut pos_enc = self
            .position_encoding
            .encode(index_dims, batch_size, pos, device)?
            .to_dtype(inputs.dtype())?;
        debug!(pos_enc = ?pos_enc.dims(), "position encoding before projection");

        if let Some(projection) = &self.positions_projection {
            pos_enc = projection.forward(&pos_enc)?;
        }

        if !network_input_is_1d {
            let mut shape = inputs.dims()[..inputs.rank() - 1].to_vec();
            shape.push(pos_enc.dim(D::Minus1)?);
            pos_enc = pos_enc.reshape(shape)?;
        }
        debug!(inputs = ?inputs.dims(), pos_enc = ?pos_enc.dims(), "attaching position encoding");

        let with_pos = match self.config.concat_or_add_pos {
            ConcatOrAdd::Concat => Tensor::cat(&[&inputs, &pos_enc], D::Minus1)?,
            ConcatOrAdd::Add => {
                let pos_channels = pos_enc.dim(D::Minus1)?;
                if pos_channels != channels {
                    return Err(Error::Shape(format!(
                        "cannot add a {pos_channels}-channel position encoding to {channels}-channel inputs"
                    )));
                }
                inputs.add(&pos_enc)?
            }
        };
        Ok((with_pos, inputs))
    }
}

fn expect_rank(inputs: &Tensor, rank: usize, prep_type: PrepType) -> Result<()> {
    if inputs.rank() != rank {
        return Err(Error::Shape(format!(
            "{prep_type} expects rank {rank} inputs, got {:?}",
            inputs.dims()
        )));
    }
    Ok(())
}

/// Keep every `step`-th element along `dim`.
fn subsample(xs: &Tensor, dim: usize, step: usize) -> Result<Tensor> {
    if step == 1 {
        return Ok(xs.clone());
    }
    let len = xs.dim(dim)?;
    let ids = Tensor::arange_step(0u32, len as u32, step as u32, xs.device())?;
    Ok(xs.index_select(&ids, dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn build(config: ImagePreprocessorConfig, varmap: &VarMap) -> Result<ImagePreprocessor> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ImagePreprocessor::new(config, vb)
    }

    fn fourier(num_bands: usize) -> PositionEncodingConfig {
        PositionEncodingConfig::Fourier {
            num_bands,
            max_resolution: vec![],
            concat_pos: true,
            sine_only: false,
        }
    }

    #[test]
    fn test_parse_enum_strings() {
        assert_eq!("conv1x1".parse::<PrepType>().unwrap(), PrepType::Conv1x1);
        assert!(matches!(
            "rgb".parse::<PrepType>(),
            Err(Error::InvalidPrepType(_))
        ));
        assert!(matches!(
            "mul".parse::<ConcatOrAdd>(),
            Err(Error::InvalidConcatOrAdd(_))
        ));
        let bad = serde_json::from_str::<ImagePreprocessorConfig>(r#"{"prep_type": "rgb"}"#);
        assert!(bad.is_err());
        let ok: ImagePreprocessorConfig =
            serde_json::from_str(r#"{"prep_type": "patches", "concat_or_add_pos": "add"}"#).unwrap();
        assert_eq!(ok.prep_type, PrepType::Patches);
        assert_eq!(ok.concat_or_add_pos, ConcatOrAdd::Add);
    }

    #[test]
    fn test_conv_requires_power_of_four() {
        let varmap = VarMap::new();
        let config = ImagePreprocessorConfig {
            spatial_downsample: 2,
            ..Default::default()
        };
        assert!(matches!(build(config, &varmap), Err(Error::InvalidConfig(_))));

        let config = ImagePreprocessorConfig {
            temporal_downsample: 2,
            ..Default::default()
        };
        assert!(build(config, &varmap).is_err());

        let config = ImagePreprocessorConfig {
            spatial_downsample: 16,
            ..Default::default()
        };
        assert!(build(config, &varmap).is_ok());
    }

    #[test]
    fn test_conv1x1_rejects_temporal_downsample() {
        let varmap = VarMap::new();
        let config = ImagePreprocessorConfig {
            prep_type: PrepType::Conv1x1,
            temporal_downsample: 2,
            ..Default::default()
        };
        assert!(matches!(build(config, &varmap), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_conv_forward_with_fourier() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                out_channels: 8,
                position_encoding: fourier(4),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, true).unwrap();
        // 16x16 -> 3x3 tokens; 8 conv channels + 2 * 2 * 4 + 2 position channels
        assert_eq!(out.dims(), &[1, 9, 26]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 26);
    }

    #[test]
    fn test_patches_with_trainable_positions() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Patches,
                position_encoding: PositionEncodingConfig::Trainable {
                    index_dim: 4,
                    num_channels: 16,
                },
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, true).unwrap();
        assert_eq!(out.dims(), &[2, 4, 64]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 64);
    }

    #[test]
    fn test_patches_projection() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Patches,
                spatial_downsample: 2,
                conv_after_patching: true,
                out_channels: 10,
                position_encoding: fourier(2),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, true).unwrap();
        assert_eq!(out.dims(), &[1, 4, 10 + 10]);
    }

    #[test]
    fn test_video_patches_squeeze_single_step() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Patches,
                spatial_downsample: 2,
                temporal_downsample: 2,
                position_encoding: fourier(2),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let features = pre.featurize(&xs).unwrap();
        assert_eq!(features.dims(), &[1, 2, 2, 24]);
        let out = pre.forward(&xs, None, true).unwrap();
        assert_eq!(out.dims(), &[1, 4, 24 + 10]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), out.dim(2).unwrap());
    }

    #[test]
    fn test_pixels_add_mode() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                spatial_downsample: 2,
                concat_or_add_pos: ConcatOrAdd::Add,
                position_encoding: PositionEncodingConfig::Trainable {
                    index_dim: 16,
                    num_channels: 3,
                },
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let (with_pos, without_pos) = pre
            .build_network_inputs(&pre.featurize(&xs).unwrap(), None, true)
            .unwrap();
        assert_eq!(with_pos.dims(), &[1, 16, 3]);
        assert_eq!(without_pos.dims(), &[1, 16, 3]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 3);
    }

    #[test]
    fn test_pixels_subsample_picks_strided_pixels() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                spatial_downsample: 2,
                in_channels: 1,
                position_encoding: fourier(1),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let features = pre.featurize(&xs).unwrap();
        let v = features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![0., 2., 8., 10.]);
    }

    #[test]
    fn test_add_mode_channel_mismatch() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                spatial_downsample: 1,
                concat_or_add_pos: ConcatOrAdd::Add,
                position_encoding: fourier(2),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(pre.forward(&xs, None, true), Err(Error::Shape(_))));
    }

    #[test]
    fn test_conv1x1_projected_positions_keep_spatial_layout() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Conv1x1,
                spatial_downsample: 2,
                out_channels: 5,
                project_pos_dim: Some(7),
                position_encoding: fourier(2),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, false).unwrap();
        assert_eq!(out.dims(), &[1, 4, 4, 12]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 12);
    }

    #[test]
    fn test_supplied_positions_are_used() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                spatial_downsample: 1,
                position_encoding: fourier(1),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let pos = Tensor::zeros((1, 16, 2), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, Some(&pos), true).unwrap();
        // 3 inputs, 2 raw coords, 2 sines, 2 cosines
        assert_eq!(out.dims(), &[1, 16, 9]);
        let row = &out.to_vec3::<f32>().unwrap()[0][5];
        assert_eq!(&row[3..], &[0., 0., 0., 0., 1., 1.]);
    }

    #[test]
    fn test_video_patches_keep_time_axis() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Patches,
                spatial_downsample: 2,
                temporal_downsample: 2,
                position_encoding: fourier(1),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 4, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(pre.featurize(&xs).unwrap().dims(), &[1, 2, 2, 2, 24]);
        let out = pre.forward(&xs, None, true).unwrap();
        // 24 patch channels, 3 * 1 * 2 + 3 position channels
        assert_eq!(out.dims(), &[1, 8, 33]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), out.dim(2).unwrap());
    }

    #[test]
    fn test_video_pixels_stride_time_and_space() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                spatial_downsample: 2,
                temporal_downsample: 2,
                in_channels: 1,
                position_encoding: fourier(1),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::arange(0f32, 64., &Device::Cpu)
            .unwrap()
            .reshape((1, 4, 1, 4, 4))
            .unwrap();
        let features = pre.featurize(&xs).unwrap();
        assert_eq!(features.dims(), &[1, 2, 2, 2, 1]);
        let v = features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![0., 2., 8., 10., 32., 34., 40., 42.]);

        let out = pre.forward(&xs, None, true).unwrap();
        assert_eq!(out.dims(), &[1, 8, 10]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 10);
    }

    #[test]
    fn test_pixels_rejects_other_ranks() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Pixels,
                position_encoding: fourier(1),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(pre.featurize(&xs), Err(Error::Shape(_))));
        assert!(matches!(pre.num_channels(xs.dims()), Err(Error::Shape(_))));
    }

    #[test]
    fn test_conv_forward_two_layers() {
        let varmap = VarMap::new();
        let pre = build(
            ImagePreprocessorConfig {
                spatial_downsample: 16,
                out_channels: 8,
                position_encoding: fourier(2),
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, true).unwrap();
        // 64 -> 32 -> 15, then 15 -> 8 -> 3
        assert_eq!(out.dims(), &[1, 9, 18]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 18);
    }

    #[test]
    fn test_projection_needs_known_index_dims() {
        let varmap = VarMap::new();
        let config = ImagePreprocessorConfig {
            prep_type: PrepType::Patches,
            spatial_downsample: 2,
            temporal_downsample: 2,
            project_pos_dim: Some(4),
            position_encoding: fourier(1),
            ..Default::default()
        };
        assert!(matches!(build(config, &varmap), Err(Error::InvalidConfig(_))));

        let pre = build(
            ImagePreprocessorConfig {
                prep_type: PrepType::Patches,
                spatial_downsample: 2,
                temporal_downsample: 2,
                project_pos_dim: Some(4),
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 1,
                    max_resolution: vec![2, 2, 2],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            &varmap,
        )
        .unwrap();
        let xs = Tensor::ones((1, 4, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let out = pre.forward(&xs, None, true).unwrap();
        assert_eq!(out.dims(), &[1, 8, 24 + 4]);
        assert_eq!(pre.num_channels(xs.dims()).unwrap(), 28);
    }
}
