use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gmaps_geocoder::GoogleGeocoder;
use homeloc_common::{PipelineConfig, Secrets};
use homeloc_pipeline::paths::CohortPaths;
use homeloc_pipeline::runner::preview_chunks;
use homeloc_pipeline::{ChunkSpec, CohortRunner, PipelineDeps, RunOptions, Stage, Tier};
use twitterapi_client::TwitterApiClient;

#[derive(Parser)]
#[command(name = "homeloc")]
#[command(about = "Infer home locations for social media users")]
#[command(version)]
struct Cli {
    /// TOML file overriding the default configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CohortArgs {
    /// Cohorts to process, comma separated (default: every configured cohort)
    #[arg(long, value_delimiter = ',')]
    cohorts: Vec<String>,

    /// 1-indexed inclusive range into the configured cohort list, e.g. 1-5
    #[arg(long, conflicts_with = "cohorts")]
    range: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, or a single stage of it
    Run {
        #[command(flatten)]
        cohorts: CohortArgs,

        /// Run only this stage
        #[arg(long, value_enum)]
        stage: Option<Stage>,

        /// Restrict per-tier stages to star or regular users
        #[arg(long = "user-type")]
        user_type: Option<Tier>,

        /// Process only chunk i of M, e.g. 3/20
        #[arg(long)]
        chunk: Option<ChunkSpec>,

        /// Concurrent fetch workers
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Show how each cohort's users split into chunks, without processing
    Chunks {
        #[command(flatten)]
        cohorts: CohortArgs,

        /// Number of chunks
        #[arg(long)]
        count: usize,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("homeloc=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn select_cohorts(config: &PipelineConfig, args: &CohortArgs) -> Result<Vec<String>> {
    if !args.cohorts.is_empty() {
        return Ok(args.cohorts.clone());
    }
    let Some(range) = &args.range else {
        return Ok(config.cohorts.clone());
    };

    let (start, end) = range
        .split_once('-')
        .with_context(|| format!("--range must look like 1-5, got {range:?}"))?;
    let start: usize = start.trim().parse().context("invalid --range start")?;
    let end: usize = end.trim().parse().context("invalid --range end")?;
    anyhow::ensure!(
        start >= 1 && start <= end && end <= config.cohorts.len(),
        "--range {range} is outside 1-{}",
        config.cohorts.len()
    );
    Ok(config.cohorts[start - 1..end].to_vec())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Error: {e:#}");
        return ExitCode::from(2);
    }

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Chunks { cohorts, count } => {
            for cohort in select_cohorts(&config, &cohorts)? {
                preview_chunks(&CohortPaths::new(&cohort, &config), count)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            cohorts,
            stage,
            user_type,
            chunk,
            threads,
        } => {
            if let Some(t) = threads {
                config.threads = t;
            }
            config.validate()?;
            let selected = select_cohorts(&config, &cohorts)?;

            let secrets = Secrets::from_env()?;
            let graph = TwitterApiClient::new(secrets.twitterapi_key).page_size(config.page_size);
            let geocoder = GoogleGeocoder::new(secrets.google_maps_api_key);
            let deps = PipelineDeps::builder()
                .config(config)
                .graph(Arc::new(graph))
                .geocoder(Arc::new(geocoder))
                .build();

            let options = RunOptions {
                stage,
                tier: user_type,
                chunk,
            };
            info!(
                cohorts = selected.len(),
                stage = ?stage,
                chunk = ?chunk.map(|c| c.to_string()),
                threads = deps.config.threads,
                "Starting pipeline"
            );

            let mut failed = 0;
            for cohort in &selected {
                let runner = CohortRunner::new(cohort, &deps);
                match runner.run(options).await {
                    Ok(()) => info!(cohort = cohort.as_str(), "Cohort finished"),
                    Err(e) => {
                        failed += 1;
                        error!(cohort = cohort.as_str(), error = ?e, "Cohort failed");
                    }
                }
            }

            info!(total = selected.len(), failed, "Pipeline finished");
            if !selected.is_empty() && failed == selected.len() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
