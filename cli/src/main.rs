use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use model::{FloodModel, ModelDefinition};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("flood-forecast failed: {:#}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Build a forecasting model and run a smoke forward pass", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON model definition"
    )]
    config: PathBuf,

    #[arg(long, default_value_t = 2, help = "Batch size of the random input")]
    batch: usize,

    #[arg(long, help = "Force the CPU backend even when CUDA is available")]
    cpu: bool,
}

fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu || std::env::var("CANDLE_FORCE_CPU").is_ok() {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0).context("failed to probe CUDA backend")?;
    if device.is_cuda() {
        log::info!("CUDA device selected");
    } else {
        log::info!("CUDA unavailable, using CPU");
    }
    Ok(device)
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.batch == 0 {
        anyhow::bail!("--batch must be at least 1");
    }

    let definition = ModelDefinition::from_path(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let device = select_device(args.cpu)?;
    let model = FloodModel::build(&definition, &device)
        .with_context(|| format!("failed to build {}", definition.model.name()))?;

    let output = model
        .smoke_forward(args.batch, &device)
        .context("smoke forward pass failed")?;
    println!(
        "{} ({:?}, {} parameters): output shape {:?}",
        model.name(),
        definition.precision,
        model.num_parameters(),
        output.dims()
    );
    Ok(())
}
