//! Core types for Perceiver IO preprocessing and vision model tooling.
//!
//! This crate provides:
//! - configuration types for ConvNeXt, ViT-MAE and Perceiver models,
//!   loadable from YAML or Hugging Face `config.json` files;
//! - Perceiver IO position encodings and text/image pre- and
//!   post-processors built on candle;
//! - conversion of reference ViT-MAE checkpoints to Hugging Face naming.

pub mod convert;
pub mod downsample;
pub mod image;
pub mod position;
pub mod text;

mod config;
mod error;

pub use config::{
    ConfigFile, ConvNextConfig, ConvNextSummary, FeatureExtractorConfig, PerceiverConfig,
    ViTMAEConfig,
};
pub use convert::{convert_checkpoint, ConversionReport, ConvertOptions, KeyRenamer};
pub use error::{Error, Result};
pub use image::{ConcatOrAdd, ImagePreprocessor, ImagePreprocessorConfig, PrepType};
pub use position::{PositionEncoding, PositionEncodingConfig};
pub use text::{TextPostprocessor, TextPreprocessor};
