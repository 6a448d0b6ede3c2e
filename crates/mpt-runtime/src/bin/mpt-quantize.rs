//! Re-encode an f32/f16 MPT container into a block-quantized one.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use mpt_runtime::model::FileType;
use mpt_runtime::quantization::Quantizer;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mpt-quantize", about = "Quantize MPT model weights")]
struct Cli {
    /// Source model (f32 or f16)
    input: PathBuf,
    /// Destination model
    output: PathBuf,
    /// Target encoding, by name or id
    #[arg(value_name = "TYPE")]
    target: String,
}

fn print_usage() {
    let usage = Cli::command().render_usage();
    eprintln!("{usage}");
    for (name, ftype) in FileType::named_targets() {
        eprintln!("  type = \"{name}\" or {}", ftype.id());
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let target = FileType::parse(&cli.target)
        .with_context(|| format!("invalid quantization type '{}'", cli.target))?;
    let quantizer = Quantizer::for_mpt(target);

    let started = Instant::now();
    let report = quantizer
        .run(&cli.input, &cli.output)
        .with_context(|| format!("failed to quantize '{}'", cli.input.display()))?;
    let quantize_ms = started.elapsed().as_secs_f64() * 1000.0;

    info!(
        tensors = report.tensors,
        quantized = report.quantized,
        size_original_mb = report.size_original as f64 / (1024.0 * 1024.0),
        size_quantized_mb = report.size_quantized as f64 / (1024.0 * 1024.0),
        "quantization finished"
    );
    info!(quantize_ms, "quantize time");
    Ok(())
}

fn main() -> Result<()> {
    let started = Instant::now();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(_) => {
            print_usage();
            std::process::exit(1);
        }
    };

    run_cli(cli)?;

    let total_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(total_ms, "total time");
    Ok(())
}
