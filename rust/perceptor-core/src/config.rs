//! Model configuration types mirroring the Hugging Face `config.json` files.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Loading and saving shared by every config type.
///
/// YAML and JSON are both accepted. YAML dumps produced from Python
/// dataclasses carry `!!python/object:` tags which are stripped before
/// parsing.
pub trait ConfigFile: Serialize + DeserializeOwned {
    /// Load from a YAML file.
    fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&read_file(path.as_ref())?)
    }

    /// Parse from a YAML string.
    fn from_yaml_str(content: &str) -> Result<Self> {
        let cleaned = strip_python_tags(content);
        Ok(serde_yaml::from_str(&cleaned)?)
    }

    /// Load from a JSON file.
    fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    /// Parse from a JSON string.
    fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load from a file, picking the format from its extension.
    ///
    /// `.json` is parsed as JSON, everything else as YAML.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }

    /// Serialize to pretty-printed JSON.
    fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write as pretty-printed JSON.
    fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string()?).map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// ConvNeXt
// ---------------------------------------------------------------------------

/// ConvNeXt backbone configuration.
///
/// The defaults yield the `facebook/convnext-tiny-224` architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNextConfig {
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_num_stages")]
    pub num_stages: usize,
    /// Dimensionality of each stage.
    #[serde(default = "default_convnext_dims", alias = "hidden_sizes")]
    pub dims: Vec<usize>,
    /// Number of blocks in each stage.
    #[serde(default = "default_convnext_depths")]
    pub depths: Vec<usize>,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub is_encoder_decoder: bool,
    /// Initial value of the per-channel layer scale. Zero disables it.
    #[serde(default = "default_layer_scale_init_value")]
    pub layer_scale_init_value: f64,
    /// Stochastic depth rate.
    #[serde(default)]
    pub drop_path_rate: f64,
    #[serde(default = "default_convnext_model_type")]
    pub model_type: String,
}

fn default_num_channels() -> usize {
    3
}
fn default_num_stages() -> usize {
    4
}
fn default_convnext_dims() -> Vec<usize> {
    vec![96, 192, 384, 768]
}
fn default_convnext_depths() -> Vec<usize> {
    vec![3, 3, 9, 3]
}
fn default_initializer_range() -> f64 {
    0.02
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}
fn default_layer_scale_init_value() -> f64 {
    1e-6
}
fn default_convnext_model_type() -> String {
    "convnext".to_string()
}

impl Default for ConvNextConfig {
    fn default() -> Self {
        Self {
            num_channels: default_num_channels(),
            num_stages: default_num_stages(),
            dims: default_convnext_dims(),
            depths: default_convnext_depths(),
            initializer_range: default_initializer_range(),
            layer_norm_eps: default_layer_norm_eps(),
            is_encoder_decoder: false,
            layer_scale_init_value: default_layer_scale_init_value(),
            drop_path_rate: 0.0,
            model_type: default_convnext_model_type(),
        }
    }
}

impl ConfigFile for ConvNextConfig {}

impl ConvNextConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 {
            return Err(Error::Validation("num_stages must be > 0".to_string()));
        }
        if self.dims.len() != self.num_stages {
            return Err(Error::Validation(format!(
                "dims has {} entries but num_stages is {}",
                self.dims.len(),
                self.num_stages
            )));
        }
        if self.depths.len() != self.num_stages {
            return Err(Error::Validation(format!(
                "depths has {} entries but num_stages is {}",
                self.depths.len(),
                self.num_stages
            )));
        }
        if self.dims.contains(&0) || self.depths.contains(&0) {
            return Err(Error::Validation(
                "dims and depths must all be > 0".to_string(),
            ));
        }
        if self.num_channels == 0 {
            return Err(Error::Validation("num_channels must be > 0".to_string()));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(Error::Validation(format!(
                "layer_norm_eps ({}) must be > 0",
                self.layer_norm_eps
            )));
        }
        if !(0.0..1.0).contains(&self.drop_path_rate) {
            return Err(Error::Validation(format!(
                "drop_path_rate ({}) must be in [0, 1)",
                self.drop_path_rate
            )));
        }
        Ok(())
    }

    /// Total number of ConvNeXt blocks across all stages.
    pub fn num_blocks(&self) -> usize {
        self.depths.iter().sum()
    }

    /// Total stride of the last stage: the stem divides by 4, each further
    /// stage by 2. Saturates at `usize::MAX`.
    pub fn output_stride(&self) -> usize {
        let shift = self.num_stages.saturating_sub(1).saturating_add(2);
        u32::try_from(shift)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .unwrap_or(usize::MAX)
    }

    /// Compute a summary of the backbone's architecture and parameters.
    ///
    /// Counts follow the reference layout: a 4x4 stride-4 patchify stem with
    /// LayerNorm, a LayerNorm + 2x2 stride-2 conv between stages, and blocks
    /// made of a 7x7 depthwise conv, LayerNorm and a 4x inverted MLP.
    pub fn compute_summary(&self) -> ConvNextSummary {
        let layer_norm = |d: usize| 2 * d;
        let uses_layer_scale = self.layer_scale_init_value > 0.0;

        let first = self.dims.first().copied().unwrap_or(0);
        let stem_params = self.num_channels * first * 16 + first + layer_norm(first);

        let mut downsample_params = 0;
        let mut stage_params = Vec::with_capacity(self.dims.len());
        for (i, (&dim, &depth)) in self.dims.iter().zip(self.depths.iter()).enumerate() {
            if i > 0 {
                let prev = self.dims[i - 1];
                downsample_params += layer_norm(prev) + prev * dim * 4 + dim;
            }
            let dwconv = dim * 49 + dim;
            let pwconv1 = dim * 4 * dim + 4 * dim;
            let pwconv2 = 4 * dim * dim + dim;
            let gamma = if uses_layer_scale { dim } else { 0 };
            let block = dwconv + layer_norm(dim) + pwconv1 + pwconv2 + gamma;
            stage_params.push(block * depth);
        }

        let last = self.dims.last().copied().unwrap_or(0);
        let final_norm_params = layer_norm(last);
        let blocks_params: usize = stage_params.iter().sum();
        let total_params = stem_params + downsample_params + blocks_params + final_norm_params;

        ConvNextSummary {
            total_params,
            stem_params,
            downsample_params,
            stage_params,
            final_norm_params,
            num_stages: self.num_stages,
            num_blocks: self.num_blocks(),
            dims: self.dims.clone(),
            depths: self.depths.clone(),
            output_dim: last,
            output_stride: self.output_stride(),
        }
    }
}

/// Summary of a ConvNeXt backbone's architecture and parameter counts.
#[derive(Debug, Clone, Serialize)]
pub struct ConvNextSummary {
    pub total_params: usize,
    pub stem_params: usize,
    pub downsample_params: usize,
    pub stage_params: Vec<usize>,
    pub final_norm_params: usize,
    pub num_stages: usize,
    pub num_blocks: usize,
    pub dims: Vec<usize>,
    pub depths: Vec<usize>,
    pub output_dim: usize,
    pub output_stride: usize,
}

impl ConvNextSummary {
    /// Estimated memory for float32 parameters in bytes.
    pub fn param_memory_bytes(&self) -> usize {
        self.total_params * 4
    }

    /// Format the summary as a human-readable string.
    pub fn display(&self) -> String {
        let param_mb = self.param_memory_bytes() as f64 / 1_000_000.0;
        let total_m = self.total_params as f64 / 1_000_000.0;
        let stages = self
            .stage_params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                format!(
                    "  Stage {}:            {} (dim {}, depth {})",
                    i, p, self.dims[i], self.depths[i]
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"ConvNeXt Summary
================
Architecture:
  Stages:             {}
  Blocks:             {}
  Output Dim:         {}
  Output Stride:      {}

Parameters:
  Total:              {:.2}M
  Stem:               {}
  Downsampling:       {}
{}
  Final Norm:         {}

Memory:
  Parameters:         {:.2} MB (float32)"#,
            self.num_stages,
            self.num_blocks,
            self.output_dim,
            self.output_stride,
            total_m,
            self.stem_params,
            self.downsample_params,
            stages,
            self.final_norm_params,
            param_mb,
        )
    }
}

// ---------------------------------------------------------------------------
// ViT-MAE
// ---------------------------------------------------------------------------

/// ViT masked autoencoder configuration (encoder and decoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViTMAEConfig {
    #[serde(default = "default_vit_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_vit_num_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_vit_num_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_vit_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub hidden_dropout_prob: f64,
    #[serde(default)]
    pub attention_probs_dropout_prob: f64,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    #[serde(default = "default_decoder_num_heads")]
    pub decoder_num_attention_heads: usize,
    #[serde(default = "default_decoder_hidden_size")]
    pub decoder_hidden_size: usize,
    #[serde(default = "default_decoder_num_layers")]
    pub decoder_num_hidden_layers: usize,
    #[serde(default = "default_decoder_intermediate_size")]
    pub decoder_intermediate_size: usize,
    #[serde(default = "default_mask_ratio")]
    pub mask_ratio: f64,
    #[serde(default)]
    pub norm_pix_loss: bool,
    #[serde(default = "default_vit_mae_model_type")]
    pub model_type: String,
}

fn default_vit_hidden_size() -> usize {
    768
}
fn default_vit_num_layers() -> usize {
    12
}
fn default_vit_num_heads() -> usize {
    12
}
fn default_vit_intermediate_size() -> usize {
    3072
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_image_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_decoder_num_heads() -> usize {
    16
}
fn default_decoder_hidden_size() -> usize {
    512
}
fn default_decoder_num_layers() -> usize {
    8
}
fn default_decoder_intermediate_size() -> usize {
    2048
}
fn default_mask_ratio() -> f64 {
    0.75
}
fn default_vit_mae_model_type() -> String {
    "vit_mae".to_string()
}

impl Default for ViTMAEConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_vit_hidden_size(),
            num_hidden_layers: default_vit_num_layers(),
            num_attention_heads: default_vit_num_heads(),
            intermediate_size: default_vit_intermediate_size(),
            hidden_act: default_hidden_act(),
            hidden_dropout_prob: 0.0,
            attention_probs_dropout_prob: 0.0,
            initializer_range: default_initializer_range(),
            layer_norm_eps: default_layer_norm_eps(),
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            num_channels: default_num_channels(),
            qkv_bias: true,
            decoder_num_attention_heads: default_decoder_num_heads(),
            decoder_hidden_size: default_decoder_hidden_size(),
            decoder_num_hidden_layers: default_decoder_num_layers(),
            decoder_intermediate_size: default_decoder_intermediate_size(),
            mask_ratio: default_mask_ratio(),
            norm_pix_loss: false,
            model_type: default_vit_mae_model_type(),
        }
    }
}

impl ConfigFile for ViTMAEConfig {}

impl ViTMAEConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Validation(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.decoder_num_attention_heads == 0
            || self.decoder_hidden_size % self.decoder_num_attention_heads != 0
        {
            return Err(Error::Validation(format!(
                "decoder_hidden_size ({}) must be divisible by decoder_num_attention_heads ({})",
                self.decoder_hidden_size, self.decoder_num_attention_heads
            )));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(Error::Validation(format!(
                "image_size {} must be divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.num_hidden_layers == 0 {
            return Err(Error::Validation("num_hidden_layers must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.mask_ratio) {
            return Err(Error::Validation(format!(
                "mask_ratio ({}) must be in [0, 1)",
                self.mask_ratio
            )));
        }
        Ok(())
    }

    /// Number of patches the encoder sees before masking.
    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Number of patches kept visible after random masking.
    pub fn num_visible_patches(&self) -> usize {
        let num_patches = self.num_patches();
        (num_patches as f64 * (1.0 - self.mask_ratio)) as usize
    }
}

// ---------------------------------------------------------------------------
// Perceiver
// ---------------------------------------------------------------------------

/// Perceiver IO settings consumed by the text pre- and post-processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceiverConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    /// Maximum number of text positions.
    #[serde(default = "default_seq_len", alias = "max_position_embeddings")]
    pub seq_len: usize,
}

fn default_vocab_size() -> usize {
    262
}
fn default_d_model() -> usize {
    768
}
fn default_seq_len() -> usize {
    2048
}

impl Default for PerceiverConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            d_model: default_d_model(),
            seq_len: default_seq_len(),
        }
    }
}

impl ConfigFile for PerceiverConfig {}

impl PerceiverConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("seq_len", self.seq_len),
        ] {
            if value == 0 {
                return Err(Error::Validation(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feature extractor
// ---------------------------------------------------------------------------

/// Image feature extractor settings written next to converted weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_image_size")]
    pub size: usize,
    /// PIL resampling filter id; 2 is bilinear.
    #[serde(default = "default_resample")]
    pub resample: u32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_image_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_image_std")]
    pub image_std: [f32; 3],
    #[serde(default = "default_feature_extractor_type")]
    pub feature_extractor_type: String,
}

fn default_resample() -> u32 {
    2
}
fn default_image_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}
fn default_image_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}
fn default_feature_extractor_type() -> String {
    "ViTMAEFeatureExtractor".to_string()
}

impl FeatureExtractorConfig {
    /// Feature extractor settings matching a model's input resolution.
    pub fn for_image_size(size: usize) -> Self {
        Self {
            do_resize: true,
            size,
            resample: default_resample(),
            do_normalize: true,
            image_mean: default_image_mean(),
            image_std: default_image_std(),
            feature_extractor_type: default_feature_extractor_type(),
        }
    }
}

impl ConfigFile for FeatureExtractorConfig {}

/// Strip Python object tags from YAML content.
///
/// Converts lines like:
/// `!!python/object:transformers.ConvNextConfig`
/// to empty lines or just removes the tag portion.
fn strip_python_tags(content: &str) -> String {
    const TAG: &str = "!!python/object:";
    let mut result = String::with_capacity(content.len());
    for line in content.lines() {
        match line.find(TAG) {
            Some(idx) => {
                let rest = &line[idx + TAG.len()..];
                let tag_end = rest
                    .find(char::is_whitespace)
                    .map(|i| idx + TAG.len() + i)
                    .unwrap_or(line.len());
                result.push_str(&line[..idx]);
                result.push_str(&line[tag_end..]);
            }
            None => result.push_str(line),
        }
        result.push('\n');
    }
    result
}
