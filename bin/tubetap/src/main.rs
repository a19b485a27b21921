use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tubetap_browser::find_browser_binary;
use tubetap_core::{ExtractorConfig, TrackDescriptor};
use tubetap_extract::Extractor;

#[derive(Parser)]
#[command(name = "tubetap")]
#[command(about = "Headless-browser audio extraction for queued playback", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a query into track metadata
    Resolve {
        /// Free text or a platform URL
        query: String,

        /// Requester identity recorded on the descriptor
        #[arg(long, default_value = "cli")]
        requester: String,
    },

    /// Resolve a query and stream its audio to a file
    Stream {
        /// Free text or a platform URL
        query: String,

        /// Output file for the encoded audio (webm/opus)
        #[arg(short, long)]
        output: PathBuf,

        /// Requester identity recorded on the descriptor
        #[arg(long, default_value = "cli")]
        requester: String,
    },

    /// Prime upcoming tracks, then stream the first one
    Preload {
        /// Platform URLs, in queue order
        urls: Vec<String>,

        /// Output file for the first track's audio
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Check for a usable browser binary
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => ExtractorConfig::load(path)?,
        None => ExtractorConfig::default(),
    };

    match cli.command {
        Commands::Doctor => {
            match find_browser_binary() {
                Some(path) => println!("browser: {}", path),
                None => println!("no Chromium/Chrome binary found"),
            }
            Ok(())
        }
        command => {
            let extractor = Extractor::new(config);
            let result = run(&extractor, command).await;
            extractor.deactivate().await;
            result
        }
    }
}

async fn run(extractor: &Extractor, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Resolve { query, requester } => {
            let track = resolve(extractor, &query, &requester).await?;
            println!("{}", serde_json::to_string_pretty(&track)?);
            Ok(())
        }
        Commands::Stream {
            query,
            output,
            requester,
        } => {
            let track = resolve(extractor, &query, &requester).await?;
            stream_to_file(extractor, &track, &output).await
        }
        Commands::Preload { urls, output } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            let mut tracks = Vec::with_capacity(urls.len());
            for url in &urls {
                tracks.push(resolve(extractor, url, "cli").await?);
            }
            let primed = extractor.preload_batch(&tracks).await;
            println!("primed {}/{} tracks", primed, tracks.len());
            stream_to_file(extractor, &tracks[0], &output).await
        }
        Commands::Doctor => unreachable!("handled before extractor construction"),
    }
}

async fn resolve(
    extractor: &Extractor,
    query: &str,
    requester: &str,
) -> anyhow::Result<TrackDescriptor> {
    if !extractor.validate(query) {
        bail!("query looks like a local file; this extractor handles platform URLs and free text");
    }
    match extractor.resolve(query, requester).await? {
        Some(track) => Ok(track),
        None => bail!("nothing usable found for {:?}", query),
    }
}

async fn stream_to_file(
    extractor: &Extractor,
    track: &TrackDescriptor,
    output: &PathBuf,
) -> anyhow::Result<()> {
    let mut stream = extractor.open_stream(track).await?;
    let mut file = tokio::fs::File::create(output).await?;
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, closing stream");
                stream.close();
                break;
            }
            chunk = stream.recv() => match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    total += bytes.len() as u64;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    file.flush().await?;
    println!("wrote {} bytes to {}", total, output.display());
    Ok(())
}
