use std::{io, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mp4_atoms::Mp4File;

/// Prints the atom tree of an MP4 file with every property.
#[derive(Parser)]
struct Args {
    input: PathBuf,

    /// Also print properties that are implied by their atom or descriptor.
    #[arg(long)]
    implicits: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let file = Mp4File::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    println!("{}: {} tracks", args.input.display(), file.number_of_tracks(None));
    for track_id in file.track_ids() {
        println!(
            "  track {track_id}: {} ({} samples)",
            file.track_type(track_id)?,
            file.number_of_samples(track_id).unwrap_or(0),
        );
    }

    let stdout = io::stdout();
    file.dump(&mut stdout.lock(), args.implicits)?;
    Ok(())
}
