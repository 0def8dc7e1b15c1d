use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use rlm::{logging, PromptLanguage, Rlm, RlmConfig};

/// Ask a question about a document of any size.
#[derive(Debug, Parser)]
#[command(name = "rlm", version)]
struct Cli {
    /// Question to answer. May be omitted when the document carries its own task.
    #[arg(short, long, default_value = "")]
    query: String,

    /// Document to analyze; read from stdin when absent.
    #[arg(short = 'f', long)]
    context_file: Option<PathBuf>,

    /// Root model (overrides RLM_MODEL).
    #[arg(long)]
    model: Option<String>,

    /// Model for recursive calls (overrides RLM_RECURSIVE_MODEL).
    #[arg(long)]
    recursive_model: Option<String>,

    #[arg(long)]
    max_depth: Option<u32>,

    #[arg(long)]
    max_iterations: Option<u32>,

    /// Use the Japanese system prompt.
    #[arg(long)]
    japanese: bool,

    /// Debug-level logging, including model turns and code output.
    #[arg(short, long)]
    verbose: bool,

    /// Log file path (defaults to logs/rlm_<timestamp>.log).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Console logging only.
    #[arg(long, conflicts_with = "log_file")]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = if cli.no_log_file {
        None
    } else {
        Some(cli.log_file.clone().unwrap_or_else(|| logging::default_log_path("rlm")))
    };
    logging::init(cli.verbose, log_file.as_deref())?;

    let mut config = RlmConfig::from_env()?;
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(model) = cli.recursive_model {
        config.recursive_model = Some(model);
    }
    if let Some(depth) = cli.max_depth {
        config.max_depth = depth;
    }
    if let Some(iterations) = cli.max_iterations {
        config.max_iterations = iterations;
    }
    if cli.japanese {
        config.language = PromptLanguage::Japanese;
    }

    let context = match &cli.context_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read document from stdin")?;
            buf
        }
    };

    info!(
        model = %config.model,
        recursive_model = config.recursive_model(),
        context_chars = context.chars().count(),
        "Starting RLM"
    );

    let rlm = Rlm::with_http_client(config)?;
    let result = rlm.completion(&cli.query, &context).await;
    let stats = rlm.stats();

    match result {
        Ok(answer) => {
            println!("{}", answer);
            eprintln!("{}", serde_json::to_string(&stats)?);
            info!(
                model_calls = stats.model_calls,
                iterations = stats.iterations,
                depth = stats.depth,
                "RLM finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                model_calls = stats.model_calls,
                iterations = stats.iterations,
                "RLM failed: {}",
                e
            );
            Err(e.into())
        }
    }
}
