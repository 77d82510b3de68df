//! Mochi node tooling
//!
//! Inspect the pieces of the Mochi pipeline that do not need a GPU.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin mochi -- schedule --steps 50
//! cargo run --release --bin mochi -- nodes
//! cargo run --release --bin mochi -- tiles --height 60 --width 106
//! cargo run --release --bin mochi -- inspect models/vae/mochi_preview_vae_bf16.safetensors
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use candle_mochi::{
    config::DEFAULT_THRESHOLD_NOISE,
    loader::{ModelLocator, get_tensor_info},
    nodes::NodeKind,
    scheduler::linear_quadratic_schedule,
    vae::{SpatialTiling, TilePlan},
};

/// Command line arguments for the Mochi tooling
#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect Mochi schedules, nodes, tile plans and weights")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the sigma schedule used by the sampler
    Schedule {
        /// Number of sampling steps
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Noise level where the linear segment ends
        #[arg(long, default_value_t = DEFAULT_THRESHOLD_NOISE)]
        threshold_noise: f64,

        /// Length of the linear segment (defaults to steps / 2)
        #[arg(long)]
        linear_steps: Option<usize>,
    },

    /// Dump every node schema as JSON
    Nodes,

    /// Print the spatial tile plan for a latent frame
    Tiles {
        /// Latent height (video height / 8)
        #[arg(long, default_value = "60")]
        height: usize,

        /// Latent width (video width / 8)
        #[arg(long, default_value = "106")]
        width: usize,

        #[arg(long, default_value = "4")]
        num_tiles_w: usize,

        #[arg(long, default_value = "4")]
        num_tiles_h: usize,

        #[arg(long, default_value = "16")]
        overlap: usize,

        #[arg(long, default_value = "1")]
        min_block_size: usize,
    },

    /// List tensor names, dtypes and shapes of a safetensors file
    Inspect {
        /// Path to a safetensors file, or a file name under --models-dir
        weights: PathBuf,

        /// Models directory used to resolve bare file names
        #[arg(long, default_value = "models")]
        models_dir: PathBuf,

        /// Subdirectory of the models directory
        #[arg(long, default_value = "vae/mochi")]
        subdir: String,

        /// Download the file from the Hub when it is missing
        #[arg(long)]
        download: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_mochi=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Schedule {
            steps,
            threshold_noise,
            linear_steps,
        } => {
            let sigmas = linear_quadratic_schedule(steps, threshold_noise, linear_steps)?;
            info!(steps, threshold_noise, "Generated sigma schedule");
            println!("{}", serde_json::to_string_pretty(&sigmas)?);
        }
        Command::Nodes => {
            let schemas: Vec<_> = NodeKind::ALL.iter().map(NodeKind::schema).collect();
            println!("{}", serde_json::to_string_pretty(&schemas)?);
        }
        Command::Tiles {
            height,
            width,
            num_tiles_w,
            num_tiles_h,
            overlap,
            min_block_size,
        } => {
            let tiling = SpatialTiling::new(num_tiles_w, num_tiles_h, overlap, min_block_size);
            let plan = TilePlan::new(height, width, &tiling)?;
            info!(
                rows = plan.rows.num_tiles(),
                cols = plan.cols.num_tiles(),
                half_overlap_h = plan.rows.half_overlap,
                half_overlap_w = plan.cols.half_overlap,
                "Tile plan"
            );
            println!("{}", serde_json::to_string_pretty(&plan.tiles())?);
        }
        Command::Inspect {
            weights,
            models_dir,
            subdir,
            download,
        } => {
            let path = if weights.is_file() {
                weights
            } else {
                let name = weights
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("weights must name a file")?;
                ModelLocator::new(models_dir)
                    .with_download(download)
                    .resolve(&subdir, name)?
            };

            let tensors = get_tensor_info(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut names: Vec<_> = tensors.keys().collect();
            names.sort();
            info!(path = %path.display(), count = names.len(), "Loaded tensor index");
            for name in names {
                let t = &tensors[name];
                println!("{name}\t{}\t{:?}", t.dtype, t.shape);
            }
        }
    }

    Ok(())
}
