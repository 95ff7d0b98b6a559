//! Validate command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use perceptor_core::{ConfigFile, ConvNextConfig, PerceiverConfig, ViTMAEConfig};
use serde_json::json;

use crate::ConfigKind;

/// Run the validate command.
pub fn run(config_path: &Path, kind: ConfigKind, format: &str) -> Result<()> {
    let (fields, details) = match kind {
        ConfigKind::Convnext => {
            let config = load::<ConvNextConfig>(config_path)?;
            config
                .validate()
                .with_context(|| "Configuration validation failed")?;
            (
                json!({
                    "model_type": config.model_type,
                    "num_stages": config.num_stages,
                    "dims": config.dims,
                    "depths": config.depths,
                }),
                vec![
                    format!("  Stages: {}", config.num_stages),
                    format!("  Dims: {:?}", config.dims),
                    format!("  Depths: {:?}", config.depths),
                ],
            )
        }
        ConfigKind::VitMae => {
            let config = load::<ViTMAEConfig>(config_path)?;
            config
                .validate()
                .with_context(|| "Configuration validation failed")?;
            (
                json!({
                    "model_type": config.model_type,
                    "hidden_size": config.hidden_size,
                    "num_hidden_layers": config.num_hidden_layers,
                    "decoder_hidden_size": config.decoder_hidden_size,
                    "num_patches": config.num_patches(),
                }),
                vec![
                    format!("  Hidden Size: {}", config.hidden_size),
                    format!("  Layers: {}", config.num_hidden_layers),
                    format!("  Decoder Hidden Size: {}", config.decoder_hidden_size),
                    format!("  Patches: {}", config.num_patches()),
                ],
            )
        }
        ConfigKind::Perceiver => {
            let config = load::<PerceiverConfig>(config_path)?;
            config
                .validate()
                .with_context(|| "Configuration validation failed")?;
            (
                json!({
                    "vocab_size": config.vocab_size,
                    "d_model": config.d_model,
                    "seq_len": config.seq_len,
                }),
                vec![
                    format!("  Vocab Size: {}", config.vocab_size),
                    format!("  Model Dim: {}", config.d_model),
                    format!("  Sequence Length: {}", config.seq_len),
                ],
            )
        }
    };

    match format {
        "json" => {
            let result = json!({
                "valid": true,
                "config_path": config_path.display().to_string(),
                "kind": format!("{:?}", kind),
                "config": fields,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Config is valid: {:?}", config_path);
            for line in details {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn load<T: ConfigFile>(path: &Path) -> Result<T> {
    T::load(path).with_context(|| format!("Failed to load config from {:?}", path))
}
