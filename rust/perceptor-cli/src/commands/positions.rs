//! Positions command implementation.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use perceptor_core::position::FourierPositionEncoding;

/// Run the positions command.
pub fn run(
    dims_str: &str,
    num_bands: usize,
    max_resolution_str: Option<&str>,
    sine_only: bool,
    concat_pos: bool,
    rows: usize,
    format: &str,
) -> Result<()> {
    let index_dims = parse_dims(dims_str)?;
    let max_resolution = match max_resolution_str {
        Some(s) => parse_dims(s)?,
        None => index_dims.clone(),
    };
    if max_resolution.len() != index_dims.len() {
        bail!(
            "max_resolution has {} entries but dims has {}",
            max_resolution.len(),
            index_dims.len()
        );
    }

    let encoding = FourierPositionEncoding::new(num_bands, max_resolution.clone(), concat_pos, sine_only);
    let encoded = encoding
        .forward(&index_dims, 1, None, &Device::Cpu)
        .with_context(|| "Failed to build position encoding")?
        .squeeze(0)?;
    let (num_positions, channels) = encoded.dims2()?;
    let head = leading_rows(&encoded, rows.min(num_positions))?;

    match format {
        "json" => {
            let result = serde_json::json!({
                "index_dims": index_dims,
                "max_resolution": max_resolution,
                "num_bands": num_bands,
                "concat_pos": concat_pos,
                "sine_only": sine_only,
                "shape": [num_positions, channels],
                "rows": head,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Fourier Position Encoding:");
            println!("  Index Dims: {:?}", index_dims);
            println!("  Max Resolution: {:?}", max_resolution);
            println!("  Bands: {}", num_bands);
            println!("  Shape: [{}, {}]", num_positions, channels);
            for (i, row) in head.iter().enumerate() {
                let preview: Vec<String> = row.iter().take(8).map(|v| format!("{v:.4}")).collect();
                let ellipsis = if row.len() > 8 { ", ..." } else { "" };
                println!("  [{}] {}{}", i, preview.join(", "), ellipsis);
            }
        }
    }

    Ok(())
}

fn parse_dims(s: &str) -> Result<Vec<usize>> {
    let dims: Vec<usize> = s
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid dimensions '{}'", s))?;
    if dims.is_empty() || dims.contains(&0) {
        bail!("Dimensions must be positive, got '{}'", s);
    }
    Ok(dims)
}

fn leading_rows(encoded: &Tensor, rows: usize) -> Result<Vec<Vec<f32>>> {
    Ok(encoded.narrow(0, 0, rows)?.to_vec2::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims("56, 56").unwrap(), vec![56, 56]);
        assert!(parse_dims("56,x").is_err());
        assert!(parse_dims("0,4").is_err());
    }
}
