//! Convert command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use perceptor_core::{convert_checkpoint, ConfigFile, ConvertOptions, ViTMAEConfig};

/// Run the convert command.
pub fn run(
    checkpoint: &Path,
    output: &Path,
    config_path: Option<&Path>,
    key: Option<String>,
    format: &str,
) -> Result<()> {
    let config = match config_path {
        Some(path) => ViTMAEConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ViTMAEConfig::default(),
    };

    let options = ConvertOptions { key };
    let report = convert_checkpoint(checkpoint, output, &config, &options)
        .with_context(|| format!("Failed to convert checkpoint {:?}", checkpoint))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Converted checkpoint: {:?}", checkpoint);
            println!("  Output: {:?}", output);
            println!("  Tensors Read: {}", report.tensors_read);
            println!("  Renamed: {}", report.renamed);
            println!("  Split (qkv): {}", report.split);
            println!("  Tensors Written: {}", report.tensors_written);
            if !report.unchanged.is_empty() {
                println!("  Unmatched Keys: {}", report.unchanged.len());
                for key in &report.unchanged {
                    println!("    {key}");
                }
            }
        }
    }

    Ok(())
}
