//! Error types for perceptor-core.

use std::path::PathBuf;

/// Result type alias using perceptor-core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when loading configs, building preprocessors or
/// converting checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to read a file.
    #[error("failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a file.
    #[error("failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    /// Failed to parse or serialize JSON.
    #[error("failed to parse JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid preprocessing type.
    #[error("invalid prep_type '{0}', expected one of conv, patches, pixels, conv1x1")]
    InvalidPrepType(String),

    /// Invalid concat-or-add mode.
    #[error("invalid value '{0}' for concat_or_add_pos, expected concat or add")]
    InvalidConcatOrAdd(String),

    /// Invalid position encoding.
    #[error("unknown position encoding type: {0}")]
    InvalidPositionEncoding(String),

    /// Input tensor has an unexpected shape.
    #[error("shape error: {0}")]
    Shape(String),

    /// Checkpoint contents could not be converted.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Error raised by the tensor library.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
