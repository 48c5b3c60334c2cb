use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use broker_service::transcode::{Transcoder, DEFAULT_QUALITY};
use broker_service::{logging, Config};
use clap::Parser;
use tracing::error;

/// Compress a video with the configured codec program.
#[derive(Debug, Parser)]
#[command(name = "compress", version)]
struct Args {
    /// Source video
    input: PathBuf,

    /// Where to write the compressed video
    output: PathBuf,

    /// Constant rate factor: 0 is lossless, 51 is the worst quality
    #[arg(short, long, default_value_t = DEFAULT_QUALITY as i64, allow_negative_numbers = true)]
    quality: i64,

    /// Codec program, overriding CODEC_PROGRAM and the config file
    #[arg(long, env = "CODEC_PROGRAM")]
    codec: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let program = args.codec.unwrap_or(config.codec_program);

    // Without the codec binary there is nothing this command can do.
    let transcoder = Transcoder::locate(&program)?;

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }

    transcoder
        .compress(&args.input, &args.output, args.quality)
        .await
        .context("Video compression failed")?;

    println!("{}", args.output.display());
    Ok(())
}
