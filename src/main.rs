//! Docensemble CLI
//!
//! Runs the extraction pipeline on one scanned document and prints the
//! result as JSON.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docensemble::{Config, DocumentType, ExtractionResult, Pipeline, ProcessOptions};

#[derive(Parser)]
#[command(name = "docensemble")]
#[command(about = "Ensemble OCR and model routing for scanned business documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract structured fields from a scanned document
    Process {
        /// Image file (PNG, JPEG, TIFF, ...)
        file: PathBuf,

        /// Document type hint (invoice, receipt, credit_note, proforma, order)
        #[arg(long)]
        document_type: Option<String>,

        /// Budget per document in USD
        #[arg(long)]
        max_cost: Option<f64>,

        /// Minimum acceptable confidence
        #[arg(long, default_value = "0.7")]
        min_confidence: f64,

        /// Use only the best-ranked tier
        #[arg(long)]
        no_fallbacks: bool,

        /// Overall deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// JSON config file (environment variables still apply)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docensemble=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            file,
            document_type,
            max_cost,
            min_confidence,
            no_fallbacks,
            deadline_secs,
            config,
        } => {
            let config = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?,
                None => Config::from_env().unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from env: {}, using defaults", e);
                    Config::default()
                }),
            };

            let hint = document_type
                .as_deref()
                .map(|s| DocumentType::parse(s).with_context(|| format!("Unknown document type '{}'", s)))
                .transpose()?;

            let image = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let options = ProcessOptions {
                max_cost_per_doc: max_cost.or(ProcessOptions::default().max_cost_per_doc),
                min_confidence,
                enable_fallbacks: !no_fallbacks,
                deadline: deadline_secs.map(|s| Instant::now() + Duration::from_secs(s)),
            };

            let pipeline = Pipeline::from_config(&config).context("Failed to build pipeline")?;
            tracing::info!("Starting docensemble v{}", env!("CARGO_PKG_VERSION"));

            let result = match pipeline.process_document(&image, &filename, hint, &options).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(kind = e.kind(), error = %e, "Extraction failed");
                    ExtractionResult::failed(&e)
                }
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
