//! CLI tool for config validation, summarization, position encodings and
//! checkpoint conversion.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perceptor")]
#[command(author, version, about = "Perceiver IO and vision model tooling")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Which config schema a file follows.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ConfigKind {
    Convnext,
    VitMae,
    Perceiver,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file (YAML or JSON)
    Validate {
        /// Path to the configuration file
        config: PathBuf,

        /// Config schema
        #[arg(long, value_enum, default_value = "convnext")]
        kind: ConfigKind,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Summarize a ConvNeXt backbone from its configuration
    Summarize {
        /// Path to the configuration file
        config: PathBuf,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Compute a Fourier position encoding over an index grid
    Positions {
        /// Index dimensions as comma-separated values (e.g., "56,56")
        #[arg(long)]
        dims: String,

        /// Number of frequency bands per dimension
        #[arg(long, default_value = "64")]
        num_bands: usize,

        /// Maximum resolution per dimension (defaults to the index dims)
        #[arg(long)]
        max_resolution: Option<String>,

        /// Use a single sine phase instead of sine and cosine
        #[arg(long)]
        sine_only: bool,

        /// Do not prepend the raw coordinates
        #[arg(long)]
        no_concat_pos: bool,

        /// Number of leading positions to print
        #[arg(long, default_value = "3")]
        rows: usize,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Convert a reference ViT-MAE checkpoint to Hugging Face naming
    Convert {
        /// Path to the .pth/.pt/.bin or .safetensors checkpoint
        #[arg(long)]
        checkpoint: PathBuf,

        /// Output directory for model.safetensors and configs
        #[arg(long)]
        output: PathBuf,

        /// ViT-MAE configuration (defaults to the base model)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Nested state dict key inside a PyTorch checkpoint
        #[arg(long)]
        key: Option<String>,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Validate {
            config,
            kind,
            format,
        } => commands::validate::run(&config, kind, &format),
        Commands::Summarize { config, format } => commands::summarize::run(&config, &format),
        Commands::Positions {
            dims,
            num_bands,
            max_resolution,
            sine_only,
            no_concat_pos,
            rows,
            format,
        } => commands::positions::run(
            &dims,
            num_bands,
            max_resolution.as_deref(),
            sine_only,
            !no_concat_pos,
            rows,
            &format,
        ),
        Commands::Convert {
            checkpoint,
            output,
            config,
            key,
            format,
        } => commands::convert::run(&checkpoint, &output, config.as_deref(), key, &format),
    }
}
