use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mp4_atoms::Mp4File;

/// Moves the metadata of an MP4 file ahead of its media and interleaves the track chunks.
#[derive(Parser)]
struct Args {
    input: PathBuf,

    /// Output path; the input is replaced when omitted.
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    Mp4File::optimize(&args.input, args.output.as_deref())
        .with_context(|| format!("failed to optimize {}", args.input.display()))?;
    tracing::info!(input = %args.input.display(), "done");
    Ok(())
}
