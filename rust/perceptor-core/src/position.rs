//! Position encodings for Perceiver IO inputs.
//!
//! Two encodings are supported: a learned embedding table indexed by the
//! flattened position, and a fixed Fourier feature encoding of a linear
//! `[-1, 1]` coordinate grid.

use std::f64::consts::PI;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use candle_nn::{Embedding, Module, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// `steps` evenly spaced values from `start` to `end`, both inclusive.
pub fn linspace(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps - 1) as f32;
            (0..steps).map(|i| start + step * i as f32).collect()
        }
    }
}

/// Build an array of position indices for an N-D input.
///
/// Returns a tensor of shape `[index_dims[0], ..., index_dims[N-1], N]`
/// holding, for every grid point, its coordinate along each axis scaled
/// linearly into `output_range`. Axes are laid out in `ij` order.
pub fn build_linear_positions(
    index_dims: &[usize],
    output_range: (f32, f32),
    device: &Device,
) -> Result<Tensor> {
    let ranges: Vec<Vec<f32>> = index_dims
        .iter()
        .map(|&n| linspace(output_range.0, output_range.1, n))
        .collect();
    let num_points: usize = index_dims.iter().product();
    let num_dims = index_dims.len();

    let mut data = Vec::with_capacity(num_points * num_dims);
    let mut coords = vec![0usize; num_dims];
    for _ in 0..num_points {
        for (axis, &c) in coords.iter().enumerate() {
            data.push(ranges[axis][c]);
        }
        // row-major increment, last axis fastest
        for axis in (0..num_dims).rev() {
            coords[axis] += 1;
            if coords[axis] < index_dims[axis] {
                break;
            }
            coords[axis] = 0;
        }
    }

    let mut shape = index_dims.to_vec();
    shape.push(num_dims);
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Generate Fourier frequency features with linearly spaced bands.
///
/// `pos` has shape `[batch_size, n, d]`. Frequencies for dimension `i` run
/// from 1 to the Nyquist frequency `max_resolution[i] / 2`. The features of
/// the first batch element are computed and broadcast over the batch.
///
/// With `concat_pos` and two phases the channels are ordered as
/// `[dim_1..dim_d, sin(pi f_1 dim_1)..sin(pi f_K dim_d), cos(..)..]`.
/// Returns `[batch_size, n, channels]`.
pub fn generate_fourier_features(
    pos: &Tensor,
    num_bands: usize,
    max_resolution: &[usize],
    concat_pos: bool,
    sine_only: bool,
) -> Result<Tensor> {
    let (batch_size, n, d) = pos.dims3()?;
    if max_resolution.len() != d {
        return Err(Error::Shape(format!(
            "max_resolution has {} entries but positions have {} dimensions",
            max_resolution.len(),
            d
        )));
    }

    let bands: Vec<f32> = max_resolution
        .iter()
        .flat_map(|&res| linspace(1.0, res as f32 / 2.0, num_bands))
        .collect();
    let freq_bands = Tensor::from_vec(bands, (d, num_bands), pos.device())?.to_dtype(pos.dtype())?;
    debug!(pos = ?pos.dims(), bands = ?freq_bands.dims(), "fourier features");

    // [n, d, 1] * [1, d, K] -> [n, d * K]
    let per_pos = pos
        .get(0)?
        .unsqueeze(2)?
        .broadcast_mul(&freq_bands.unsqueeze(0)?)?
        .reshape((n, d * num_bands))?
        .affine(PI, 0.0)?;

    let features = if sine_only {
        per_pos.sin()?
    } else {
        Tensor::cat(&[per_pos.sin()?, per_pos.cos()?], D::Minus1)?
    };
    let channels = features.dim(1)?;
    let features = features
        .unsqueeze(0)?
        .broadcast_as((batch_size, n, channels))?
        .contiguous()?;

    if concat_pos {
        Ok(Tensor::cat(&[&pos.contiguous()?, &features], D::Minus1)?)
    } else {
        Ok(features)
    }
}

/// Check or build spatial position features.
///
/// When `pos` is `None` a linear grid over `index_dims` is built and
/// broadcast to `[batch_size, prod(index_dims), index_dims.len()]`. A
/// supplied `pos` must carry one coordinate per index dimension.
pub fn check_or_build_spatial_positions(
    pos: Option<&Tensor>,
    index_dims: &[usize],
    batch_size: usize,
    device: &Device,
) -> Result<Tensor> {
    match pos {
        None => {
            let num_points: usize = index_dims.iter().product();
            let grid = build_linear_positions(index_dims, (-1.0, 1.0), device)?
                .reshape((1, num_points, index_dims.len()))?;
            Ok(grid.broadcast_as((batch_size, num_points, index_dims.len()))?.contiguous()?)
        }
        Some(pos) => {
            let last = pos.dim(D::Minus1)?;
            if last != index_dims.len() {
                return Err(Error::Shape(format!(
                    "positions have {} coordinates but the input has {} index dimensions",
                    last,
                    index_dims.len()
                )));
            }
            Ok(pos.clone())
        }
    }
}

/// Kind of position encoding, parsed from its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEncodingKind {
    Trainable,
    Fourier,
}

impl FromStr for PositionEncodingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trainable" => Ok(Self::Trainable),
            "fourier" => Ok(Self::Fourier),
            other => Err(Error::InvalidPositionEncoding(other.to_string())),
        }
    }
}

/// Position encoding settings, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", try_from = "RawPositionEncodingConfig")]
pub enum PositionEncodingConfig {
    Trainable {
        /// Number of positions in the embedding table.
        index_dim: usize,
        num_channels: usize,
    },
    Fourier {
        num_bands: usize,
        /// Resolution per index dimension. Empty means "use the input's
        /// index dimensions".
        max_resolution: Vec<usize>,
        concat_pos: bool,
        sine_only: bool,
    },
}

impl Default for PositionEncodingConfig {
    fn default() -> Self {
        Self::Fourier {
            num_bands: 64,
            max_resolution: vec![224, 224],
            concat_pos: true,
            sine_only: false,
        }
    }
}

impl PositionEncodingConfig {
    pub fn kind(&self) -> PositionEncodingKind {
        match self {
            Self::Trainable { .. } => PositionEncodingKind::Trainable,
            Self::Fourier { .. } => PositionEncodingKind::Fourier,
        }
    }

    /// Number of channels produced for an input with `num_dims` index
    /// dimensions.
    pub fn output_size(&self, num_dims: usize) -> usize {
        match self {
            Self::Trainable { num_channels, .. } => *num_channels,
            Self::Fourier {
                num_bands,
                concat_pos,
                sine_only,
                ..
            } => {
                let phases = if *sine_only { 1 } else { 2 };
                let raw = if *concat_pos { num_dims } else { 0 };
                num_dims * num_bands * phases + raw
            }
        }
    }
}

#[derive(Deserialize)]
struct RawPositionEncodingConfig {
    #[serde(rename = "type")]
    kind: String,
    index_dim: Option<usize>,
    #[serde(default = "default_trainable_channels")]
    num_channels: usize,
    num_bands: Option<usize>,
    #[serde(default)]
    max_resolution: Vec<usize>,
    #[serde(default = "default_concat_pos")]
    concat_pos: bool,
    #[serde(default)]
    sine_only: bool,
}

fn default_trainable_channels() -> usize {
    128
}
fn default_concat_pos() -> bool {
    true
}

impl TryFrom<RawPositionEncodingConfig> for PositionEncodingConfig {
    type Error = Error;

    fn try_from(raw: RawPositionEncodingConfig) -> Result<Self> {
        match raw.kind.parse::<PositionEncodingKind>()? {
            PositionEncodingKind::Trainable => Ok(Self::Trainable {
                index_dim: raw.index_dim.ok_or_else(|| {
                    Error::InvalidConfig("trainable position encoding needs index_dim".to_string())
                })?,
                num_channels: raw.num_channels,
            }),
            PositionEncodingKind::Fourier => Ok(Self::Fourier {
                num_bands: raw.num_bands.ok_or_else(|| {
                    Error::InvalidConfig("fourier position encoding needs num_bands".to_string())
                })?,
                max_resolution: raw.max_resolution,
                concat_pos: raw.concat_pos,
                sine_only: raw.sine_only,
            }),
        }
    }
}

/// Learned position embeddings.
#[derive(Debug, Clone)]
pub struct TrainablePositionEncoding {
    embeddings: Embedding,
    index_dim: usize,
    num_channels: usize,
}

impl TrainablePositionEncoding {
    pub fn new(index_dim: usize, num_channels: usize, vb: VarBuilder) -> Result<Self> {
        let embeddings = candle_nn::embedding(index_dim, num_channels, vb.pp("position_embeddings"))?;
        Ok(Self {
            embeddings,
            index_dim,
            num_channels,
        })
    }

    pub fn index_dim(&self) -> usize {
        self.index_dim
    }

    pub fn embeddings(&self) -> &Tensor {
        self.embeddings.embeddings()
    }

    /// Look up `position_ids` (`[n]`, u32) and expand to `[batch_size, n, C]`
    /// when a batch size is given, otherwise return `[n, C]`.
    pub fn forward(&self, batch_size: Option<usize>, position_ids: &Tensor) -> Result<Tensor> {
        let embeddings = self.embeddings.forward(position_ids)?;
        match batch_size {
            Some(batch_size) => {
                let n = embeddings.dim(0)?;
                Ok(embeddings
                    .unsqueeze(0)?
                    .broadcast_as((batch_size, n, self.num_channels))?
                    .contiguous()?)
            }
            None => Ok(embeddings),
        }
    }

    /// Embeddings for positions `0..num_positions`.
    pub fn forward_range(&self, batch_size: Option<usize>, num_positions: usize) -> Result<Tensor> {
        if num_positions > self.index_dim {
            return Err(Error::Shape(format!(
                "{} positions requested but the embedding table holds {}",
                num_positions, self.index_dim
            )));
        }
        let device = self.embeddings().device();
        let ids = Tensor::arange(0u32, num_positions as u32, device)?;
        self.forward(batch_size, &ids)
    }
}

/// Fixed sinusoidal position encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct FourierPositionEncoding {
    pub num_bands: usize,
    pub max_resolution: Vec<usize>,
    pub concat_pos: bool,
    pub sine_only: bool,
}

impl FourierPositionEncoding {
    pub fn new(num_bands: usize, max_resolution: Vec<usize>, concat_pos: bool, sine_only: bool) -> Self {
        Self {
            num_bands,
            max_resolution,
            concat_pos,
            sine_only,
        }
    }

    /// Encode positions over `index_dims`, building the linear grid unless
    /// `pos` is supplied.
    pub fn forward(
        &self,
        index_dims: &[usize],
        batch_size: usize,
        pos: Option<&Tensor>,
        device: &Device,
    ) -> Result<Tensor> {
        let pos = check_or_build_spatial_positions(pos, index_dims, batch_size, device)?;
        let max_resolution = if self.max_resolution.is_empty() {
            index_dims
        } else {
            &self.max_resolution
        };
        generate_fourier_features(
            &pos,
            self.num_bands,
            max_resolution,
            self.concat_pos,
            self.sine_only,
        )
    }
}

/// A constructed position encoding.
#[derive(Debug, Clone)]
pub enum PositionEncoding {
    Trainable(TrainablePositionEncoding),
    Fourier(FourierPositionEncoding),
}

impl PositionEncoding {
    pub fn new(config: &PositionEncodingConfig, vb: VarBuilder) -> Result<Self> {
        match config {
            PositionEncodingConfig::Trainable {
                index_dim,
                num_channels,
            } => Ok(Self::Trainable(TrainablePositionEncoding::new(
                *index_dim,
                *num_channels,
                vb,
            )?)),
            PositionEncodingConfig::Fourier {
                num_bands,
                max_resolution,
                concat_pos,
                sine_only,
            } => Ok(Self::Fourier(FourierPositionEncoding::new(
                *num_bands,
                max_resolution.clone(),
                *concat_pos,
                *sine_only,
            ))),
        }
    }

    /// Encoding for a batch laid out over `index_dims`:
    /// `[batch_size, prod(index_dims), C]`.
    pub fn encode(
        &self,
        index_dims: &[usize],
        batch_size: usize,
        pos: Option<&Tensor>,
        device: &Device,
    ) -> Result<Tensor> {
        match self {
            Self::Trainable(enc) => {
                let num_positions = index_dims.iter().product();
                enc.forward_range(Some(batch_size), num_positions)
            }
            Self::Fourier(enc) => enc.forward(index_dims, batch_size, pos, device),
        }
    }
}
