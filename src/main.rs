//! curator CLI - Token-budgeted dataset curation and rate-limited chat dispatch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use curator::pipeline::{self, CurationPipeline, DispatchPipeline};
use curator::{Config, OpenAiClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "curator")]
#[command(version)]
#[command(about = "Token-budgeted dataset curation and rate-limited chat dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Curate a fine-tuning dataset under a token budget
    Curate {
        /// Path to input records JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Token budget in millions (overrides config)
        #[arg(short, long)]
        budget: Option<f64>,

        /// Model whose tokenizer prices conversations (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Report every format problem in a dataset
    Check {
        /// Path to input records JSONL file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Send prompts to the chat endpoint under the configured rate limits
    Dispatch {
        /// Path to input prompts JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Path to output outcomes JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Model to request (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# curator configuration file

[openai]
# API key (can also use the api_key_env variable)
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 180
max_retries = 0

[curation]
model = "gpt-4o-mini"
budget_millions = 1.0
system_prompt = "prompts/system.md"
# system_prompt_text = "You are a helpful assistant."

[rate_limit]
requests_per_window = 500
tokens_per_window = 200000
window_secs = 60
replenish = "rolling"  # or "continuous"

[dispatch]
model = "gpt-4o-mini"
completion_reserve = 0
# deadline_secs = 600
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            let supported = curator::curation::is_supported_model(&config.curation.model);
            info!("Configuration is valid");
            info!(
                "  Curation: {} ({}), budget {}M tokens",
                config.curation.model,
                if supported { "supported" } else { "UNSUPPORTED" },
                config.curation.budget_millions
            );
            info!(
                "  Rate limit: {} requests / {} tokens per {}s ({:?})",
                config.rate_limit.requests_per_window,
                config.rate_limit.tokens_per_window,
                config.rate_limit.window_secs,
                config.rate_limit.replenish
            );
            info!("  Dispatch model: {}", config.dispatch.model);
            return Ok(());
        }

        Commands::Check { input } => {
            let report = pipeline::check_file(&input)
                .with_context(|| format!("Failed to check {input:?}"))?;
            println!("{report}");
        }

        Commands::Curate {
            input,
            output,
            budget,
            model,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(budget) = budget {
                config.curation.budget_millions = budget;
            }
            if let Some(model) = model {
                config.curation.model = model;
            }

            let pipeline = CurationPipeline::new(&config.curation)?;
            let (result, manifest) = pipeline.run(&input, &output)?;

            println!("\n=== Curation Complete ===");
            println!("Experiment:  {}", manifest.experiment_id);
            println!("Model:       {}", manifest.model);
            println!("Accepted:    {}", result.accepted.len());
            println!("Rejected:    {}", result.total_rejected());
            for (reason, count) in &result.rejections {
                println!("  {:<28} {}", reason.as_str(), count);
            }
            println!(
                "Tokens:      {} / {}",
                result.consumed_tokens, result.ceiling_tokens
            );
            if let Some(position) = result.stopped_at {
                println!("Stopped at:  record {position} (budget reached)");
            }
            println!("Output:      {output:?}");
        }

        Commands::Dispatch {
            input,
            output,
            model,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(model) = model {
                config.dispatch.model = model;
            }

            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;
            let preamble = config
                .curation
                .load_preamble()
                .context("Failed to load system preamble")?;

            // Retries are driven by the dispatcher so each attempt is rate limited.
            let client = Arc::new(OpenAiClient::from_config(&config.openai, &api_key)?);

            let requests = pipeline::load_requests(&input, &preamble)?;
            let pipeline = DispatchPipeline::new(&config, client, true)?;

            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling outstanding requests");
                    cancel.cancel();
                }
            });

            let stats = pipeline.run(requests, &output).await?;

            println!("\n=== Dispatch Complete ===");
            println!("Requests:    {}", stats.total);
            println!("Succeeded:   {}", stats.succeeded);
            println!("Failed:      {}", stats.total_failed());
            for (kind, count) in &stats.failed {
                println!("  {:<28} {}", kind.as_str(), count);
            }
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Output:      {output:?}");
        }
    }

    Ok(())
}
