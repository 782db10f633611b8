//! Command-line front end for the Kontext pipeline.
//!
//! Thin presentation layer: parses arguments, reads the input images, drives
//! one [`PipelineSlot`], prints run events as status-log lines, and writes
//! the resulting artifacts to disk. Ctrl-C cancels the active run
//! cooperatively instead of killing the process mid-request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kontext_api::PipelineClient;
use kontext_engine::{
    DEFAULT_REFINE_PROMPT, DEFAULT_STEPS, GenerateRequest, HttpBlobFetcher, PipelineSlot,
    RefineRequest,
};
use kontext_types::{Artifact, SourceImage};

#[derive(Parser)]
#[command(name = "kontext", version, about = "Two-stage image pipeline client")]
struct Cli {
    /// Backend base URL. Falls back to KONTEXT_BASE_URL, then the local
    /// default.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a composed image from a character and a garment image.
    Generate {
        /// Character (main) image path.
        #[arg(long)]
        character: PathBuf,
        /// Garment reference image path.
        #[arg(long)]
        garment: PathBuf,
        #[arg(long, default_value = "")]
        flux_prompt: String,
        #[arg(long, default_value = "")]
        nano_prompt: String,
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: u32,
        /// Where to write the final image.
        #[arg(long, default_value = "output.png")]
        output: PathBuf,
        /// Optional path for the half-resolution intermediate.
        #[arg(long)]
        half_output: Option<PathBuf>,
    },
    /// Refine a previously generated image.
    Refine {
        /// Image to refine.
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_REFINE_PROMPT)]
        prompt: String,
        #[arg(long, default_value_t = 0.85)]
        strength: f64,
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: u32,
        /// Where to write the refined image.
        #[arg(long, default_value = "refined.png")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let client = match cli.base_url.as_deref() {
        Some(url) => PipelineClient::new(url)?,
        None => PipelineClient::from_env()?,
    };
    info!(base_url = client.base_url(), "pipeline client ready");

    let (events, mut rx) = unbounded_channel::<kontext_types::RunEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", event.to_log_line());
        }
    });

    let slot = PipelineSlot::new(
        Arc::new(client),
        Arc::new(HttpBlobFetcher::new()),
        events,
    );
    let interrupt = tokio::spawn({
        let slot = slot.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                slot.cancel();
            }
        }
    });

    let result = run(&slot, cli.command).await;

    // Drop every event sender so the printer drains and exits.
    interrupt.abort();
    drop(slot);
    let _ = printer.await;
    result
}

async fn run(slot: &PipelineSlot, command: Command) -> Result<()> {
    match command {
        Command::Generate {
            character,
            garment,
            flux_prompt,
            nano_prompt,
            steps,
            output,
            half_output,
        } => {
            let mut request = GenerateRequest::new(read_image(&character)?, read_image(&garment)?);
            request.flux_prompt = flux_prompt;
            request.nano_prompt = nano_prompt;
            request.steps = steps;

            let outcome = slot.generate(request).await?;
            if let Some(path) = half_output {
                write_artifact(&path, &outcome.half)?;
            }
            write_artifact(&output, &outcome.final_image)
        }
        Command::Refine {
            image,
            prompt,
            strength,
            steps,
            output,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            slot.seed_final_artifact(Artifact::from_bytes(bytes));

            let request = RefineRequest {
                prompt,
                strength,
                steps,
                ..RefineRequest::default()
            };
            let refined = slot.refine(request).await?;
            write_artifact(&output, &refined)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_image(path: &Path) -> Result<SourceImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image.png")
        .to_string();
    Ok(SourceImage::new(bytes, file_name))
}

fn write_artifact(path: &Path, artifact: &Artifact) -> Result<()> {
    std::fs::write(path, artifact.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = artifact.len(), "wrote artifact");
    Ok(())
}
