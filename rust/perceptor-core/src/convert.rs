//! Conversion of reference ViT-MAE checkpoints to Hugging Face naming.
//!
//! Keys are renamed through an ordered list of substitutions. Fused `qkv`
//! projections are split into separate query, key and value tensors. The
//! result is written as `model.safetensors` next to `config.json` and
//! `preprocessor_config.json`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::pickle::PthTensors;
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigFile, FeatureExtractorConfig, ViTMAEConfig};
use crate::error::{Error, Result};

/// Named tensors, ordered by key.
pub type StateDict = BTreeMap<String, Tensor>;

/// How a [`RenameRule`] matches a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Replace every occurrence of the pattern.
    Substring,
    /// Replace the whole key when it equals the pattern.
    Exact,
}

/// One step of a key rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    pub pattern: &'static str,
    pub replacement: &'static str,
    pub kind: MatchKind,
    /// Skip the rule for keys containing this text.
    pub unless: Option<&'static str>,
}

impl RenameRule {
    pub const fn substring(pattern: &'static str, replacement: &'static str) -> Self {
        Self {
            pattern,
            replacement,
            kind: MatchKind::Substring,
            unless: None,
        }
    }

    pub const fn exact(pattern: &'static str, replacement: &'static str) -> Self {
        Self {
            pattern,
            replacement,
            kind: MatchKind::Exact,
            unless: None,
        }
    }

    pub const fn unless(mut self, guard: &'static str) -> Self {
        self.unless = Some(guard);
        self
    }

    fn apply(&self, key: &str) -> Option<String> {
        if self.unless.is_some_and(|guard| key.contains(guard)) {
            return None;
        }
        match self.kind {
            MatchKind::Substring if key.contains(self.pattern) => {
                Some(key.replace(self.pattern, self.replacement))
            }
            MatchKind::Exact if key == self.pattern => Some(self.replacement.to_string()),
            _ => None,
        }
    }
}

/// Ordered key rewrite rules. Every rule sees the output of the previous
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRenamer {
    rules: Vec<RenameRule>,
}

impl KeyRenamer {
    pub fn new(rules: Vec<RenameRule>) -> Self {
        Self { rules }
    }

    /// Rules mapping the reference MAE checkpoint onto `ViTMAEForPreTraining`.
    pub fn vit_mae() -> Self {
        Self::new(vec![
            RenameRule::substring("cls_token", "vit.embeddings.cls_token"),
            RenameRule::substring("mask_token", "decoder.mask_token"),
            RenameRule::substring("decoder_pos_embed", "decoder.decoder_pos_embed"),
            RenameRule::substring("pos_embed", "vit.embeddings.position_embeddings").unless("decoder"),
            RenameRule::substring("patch_embed.proj", "vit.embeddings.patch_embeddings.projection"),
            RenameRule::substring("patch_embed.norm", "vit.embeddings.norm"),
            RenameRule::substring("decoder_blocks", "decoder.decoder_layers"),
            RenameRule::substring("blocks", "vit.encoder.layer"),
            RenameRule::substring("attn.proj", "attention.output.dense"),
            RenameRule::substring("attn", "attention.attention"),
            RenameRule::substring("norm1", "layernorm_before"),
            RenameRule::substring("norm2", "layernorm_after"),
            RenameRule::substring("mlp.fc1", "intermediate.dense"),
            RenameRule::substring("mlp.fc2", "output.dense"),
            RenameRule::substring("decoder_embed", "decoder.decoder_embed"),
            RenameRule::substring("decoder_norm", "decoder.decoder_norm"),
            RenameRule::substring("decoder_pred", "decoder.decoder_pred"),
            RenameRule::exact("norm.weight", "vit.layernorm.weight"),
            RenameRule::exact("norm.bias", "vit.layernorm.bias"),
            RenameRule::substring("head", "classifier"),
        ])
    }

    pub fn rules(&self) -> &[RenameRule] {
        &self.rules
    }

    /// Apply every rule in order.
    pub fn rename(&self, key: &str) -> String {
        let mut name = key.to_string();
        for rule in &self.rules {
            if let Some(renamed) = rule.apply(&name) {
                name = renamed;
            }
        }
        name
    }
}

/// Counts gathered while converting a checkpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub tensors_read: usize,
    pub renamed: usize,
    pub split: usize,
    pub tensors_written: usize,
    /// Source keys no rule touched.
    pub unchanged: Vec<String>,
    pub output_dir: Option<PathBuf>,
}

/// Rename keys and split fused attention projections.
///
/// `blocks.{i}.attn.qkv.{weight,bias}` is split along dim 0 into
/// `vit.encoder.layer.{i}.attention.attention.{query,key,value}` using
/// `hidden_size`; the decoder equivalent uses `decoder_hidden_size`.
pub fn convert_state_dict(
    state: impl IntoIterator<Item = (String, Tensor)>,
    renamer: &KeyRenamer,
    config: &ViTMAEConfig,
) -> Result<(StateDict, ConversionReport)> {
    let mut converted = StateDict::new();
    let mut report = ConversionReport::default();

    for (key, value) in state {
        report.tensors_read += 1;
        if key.contains("qkv") {
            for (name, tensor) in split_qkv(&key, &value, config)? {
                insert_unique(&mut converted, name, tensor)?;
            }
            report.split += 1;
            continue;
        }

        let name = renamer.rename(&key);
        if name == key {
            report.unchanged.push(key.clone());
        } else {
            report.renamed += 1;
        }
        debug!(from = %key, to = %name, "renamed");
        insert_unique(&mut converted, name, value)?;
    }

    report.tensors_written = converted.len();
    Ok((converted, report))
}

fn insert_unique(state: &mut StateDict, name: String, tensor: Tensor) -> Result<()> {
    if state.contains_key(&name) {
        return Err(Error::Checkpoint(format!(
            "two source tensors map to '{name}'"
        )));
    }
    state.insert(name, tensor);
    Ok(())
}

fn split_qkv(key: &str, value: &Tensor, config: &ViTMAEConfig) -> Result<Vec<(String, Tensor)>> {
    let parts: Vec<&str> = key.split('.').collect();
    let layer_num: usize = parts
        .get(1)
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Checkpoint(format!("cannot read a layer index from '{key}'")))?;

    let (dim, prefix) = if key.starts_with("decoder_blocks") {
        (config.decoder_hidden_size, "decoder.decoder_layers")
    } else if key.starts_with("blocks") {
        (config.hidden_size, "vit.encoder.layer")
    } else {
        return Err(Error::Checkpoint(format!("unexpected qkv tensor '{key}'")));
    };
    let suffix = match parts.last() {
        Some(&"weight") => "weight",
        Some(&"bias") => "bias",
        _ => {
            return Err(Error::Checkpoint(format!(
                "qkv tensor '{key}' is neither a weight nor a bias"
            )))
        }
    };

    let rows = value.dim(0)?;
    if rows != 3 * dim {
        return Err(Error::Checkpoint(format!(
            "'{key}' has {rows} rows, expected 3 x {dim}"
        )));
    }

    ["query", "key", "value"]
        .iter()
        .enumerate()
        .map(|(i, proj)| {
            let name = format!("{prefix}.{layer_num}.attention.attention.{proj}.{suffix}");
            Ok((name, value.narrow(0, i * dim, dim)?.contiguous()?))
        })
        .collect()
}

/// Load all tensors from a `.safetensors` file or a PyTorch pickle
/// (`.pth`, `.pt`, `.bin`). `key` selects a nested state dict inside a
/// pickle, e.g. `model` for the reference MAE checkpoints.
pub fn load_checkpoint(path: &Path, key: Option<&str>, device: &Device) -> Result<Vec<(String, Tensor)>> {
    if !path.exists() {
        return Err(Error::Checkpoint(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }
    info!("Loading checkpoint from: {}", path.display());

    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => {
            let tensors = candle_core::safetensors::load(path, device)?;
            Ok(tensors.into_iter().collect())
        }
        Some("pth") | Some("pt") | Some("bin") => {
            let pth = PthTensors::new(path, key)?;
            let names: Vec<String> = pth.tensor_infos().keys().cloned().collect();
            let mut tensors = Vec::with_capacity(names.len());
            for name in names {
                match pth.get(&name)? {
                    Some(tensor) => tensors.push((name, tensor.to_device(device)?)),
                    None => warn!("Tensor '{}' listed but not found in file", name),
                }
            }
            Ok(tensors)
        }
        other => Err(Error::Checkpoint(format!(
            "unsupported checkpoint extension {:?}, expected .safetensors, .pth, .pt or .bin",
            other.unwrap_or("")
        ))),
    }
}

/// Write weights and configs the way `save_pretrained` lays them out.
pub fn save_pretrained(
    output_dir: &Path,
    state: &StateDict,
    config: &ViTMAEConfig,
    feature_extractor: &FeatureExtractorConfig,
) -> Result<()> {
    std::fs::create_dir_all(output_dir).map_err(|e| Error::WriteFile {
        path: output_dir.to_path_buf(),
        source: e,
    })?;

    let tensors: HashMap<&str, Tensor> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();
    let weights_path = output_dir.join("model.safetensors");
    info!("Saving model to {}", weights_path.display());
    candle_core::safetensors::save(&tensors, &weights_path)?;

    config.save_json(output_dir.join("config.json"))?;
    info!("Saving feature extractor to {}", output_dir.display());
    feature_extractor.save_json(output_dir.join("preprocessor_config.json"))?;
    Ok(())
}

/// Options for [`convert_checkpoint`].
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Nested state dict key inside a PyTorch pickle.
    pub key: Option<String>,
}

/// Load, convert and save a ViT-MAE checkpoint.
pub fn convert_checkpoint(
    checkpoint: &Path,
    output_dir: &Path,
    config: &ViTMAEConfig,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    config.validate()?;
    let device = Device::Cpu;
    let state = load_checkpoint(checkpoint, options.key.as_deref(), &device)?;
    let (converted, mut report) = convert_state_dict(state, &KeyRenamer::vit_mae(), config)?;
    for key in &report.unchanged {
        warn!("No rename rule matched '{}'", key);
    }

    let feature_extractor = FeatureExtractorConfig::for_image_size(config.image_size);
    save_pretrained(output_dir, &converted, config, &feature_extractor)?;
    info!(
        "Converted {} tensors ({} renamed, {} split) into {}",
        report.tensors_read, report.renamed, report.split, report.tensors_written
    );
    report.output_dir = Some(output_dir.to_path_buf());
    Ok(report)
}
