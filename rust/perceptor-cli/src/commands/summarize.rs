//! Summarize command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use perceptor_core::{ConfigFile, ConvNextConfig};

/// Run the summarize command.
pub fn run(config_path: &Path, format: &str) -> Result<()> {
    let config = ConvNextConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    let summary = config.compute_summary();

    match format {
        "json" => {
            let result = serde_json::json!({
                "config_path": config_path.display().to_string(),
                "architecture": {
                    "num_stages": summary.num_stages,
                    "num_blocks": summary.num_blocks,
                    "dims": summary.dims,
                    "depths": summary.depths,
                    "output_dim": summary.output_dim,
                    "output_stride": summary.output_stride,
                },
                "parameters": {
                    "total": summary.total_params,
                    "total_millions": summary.total_params as f64 / 1_000_000.0,
                    "stem": summary.stem_params,
                    "downsample": summary.downsample_params,
                    "stages": summary.stage_params,
                    "final_norm": summary.final_norm_params,
                },
                "memory": {
                    "params_bytes": summary.param_memory_bytes(),
                    "params_mb": summary.param_memory_bytes() as f64 / 1_000_000.0,
                },
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("{}", summary.display());
        }
    }

    Ok(())
}
