// src/main.rs

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::sqlite::SqlitePoolOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use sleuth::analyzer::{AnalyzerGateway, GatewayConfig, HttpAnalyzer};
use sleuth::budget::CostLedger;
use sleuth::config::CONFIG;
use sleuth::patterns::PatternLibrary;
use sleuth::pipeline::{Pipeline, PipelineConfig};
use sleuth::signature::Signature;
use sleuth::store::{FeedbackOutcome, IssueStore};
use sleuth::types::FailureRecord;
use sleuth::validation::{ValidationConfig, ValidationEngine};

#[derive(Parser)]
#[command(name = "sleuth", about = "Tiered CI/CD failure analysis engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a batch of failure records and print the diagnosis report
    Analyze {
        /// JSON file containing an array of failure records
        #[arg(short, long)]
        input: PathBuf,
        /// Override the per-run budget ceiling in USD
        #[arg(long)]
        budget: Option<f64>,
    },
    /// Report whether a previously suggested fix worked
    Feedback {
        /// Issue signature from an earlier report
        signature: String,
        /// "success" or "failure"
        outcome: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level: Level = CONFIG.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let pool = SqlitePoolOptions::new()
        .max_connections(CONFIG.sqlite_max_connections)
        .connect(&CONFIG.database_url)
        .await
        .with_context(|| format!("connecting to {}", CONFIG.database_url))?;
    let store = IssueStore::new(pool);
    store.init_schema().await?;

    let patterns = Arc::new(match &CONFIG.patterns_path {
        Some(path) => PatternLibrary::from_file(Path::new(path), CONFIG.reliability_floor)
            .with_context(|| format!("loading pattern library from {path}"))?,
        None => PatternLibrary::builtin(CONFIG.reliability_floor),
    });
    info!(rules = patterns.len(), "pattern library loaded");

    match cli.command {
        Command::Analyze { input, budget } => {
            let records: Vec<FailureRecord> = {
                let text = std::fs::read_to_string(&input)
                    .with_context(|| format!("reading {}", input.display()))?;
                serde_json::from_str(&text).context("parsing failure records")?
            };

            let ledger = Arc::new(CostLedger::new(
                budget.unwrap_or(CONFIG.run_budget_usd),
                CONFIG.daily_budget_usd,
            ));
            let timeout = Duration::from_secs(CONFIG.request_timeout_secs);
            let fast = Arc::new(HttpAnalyzer::new(
                &CONFIG.backend_base_url,
                &CONFIG.backend_api_key,
                &CONFIG.fast_model,
                CONFIG.fast_max_tokens,
                timeout,
            )?);
            let deep = Arc::new(HttpAnalyzer::new(
                &CONFIG.backend_base_url,
                &CONFIG.backend_api_key,
                &CONFIG.deep_model,
                CONFIG.deep_max_tokens,
                timeout,
            )?);
            let gateway = AnalyzerGateway::new(
                fast,
                deep,
                ledger,
                GatewayConfig {
                    window_lines: CONFIG.signature_window_lines,
                    fast_call_estimate_usd: CONFIG.fast_call_estimate_usd,
                    deep_call_estimate_usd: CONFIG.deep_call_estimate_usd,
                    fast_price_per_ktok_usd: CONFIG.fast_price_per_ktok_usd,
                    deep_price_per_ktok_usd: CONFIG.deep_price_per_ktok_usd,
                },
            );
            let validator = ValidationEngine::new(ValidationConfig {
                min_confidence: CONFIG.min_confidence,
                complexity_marker_threshold: CONFIG.complexity_marker_threshold,
                reliability_floor: CONFIG.reliability_floor,
                ..ValidationConfig::default()
            });

            let pipeline = Pipeline::new(
                store,
                patterns,
                gateway,
                validator,
                PipelineConfig::from(&*CONFIG),
            );
            pipeline.load_reliability().await?;

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("cancellation requested");
                    ctrl_c_cancel.cancel();
                }
            });

            let report = pipeline.run_batch(records, cancel).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Feedback { signature, outcome } => {
            let outcome = FeedbackOutcome::parse(&outcome)
                .ok_or_else(|| anyhow::anyhow!("outcome must be 'success' or 'failure'"))?;
            let sig = Signature::from_hex(signature);
            match store
                .record_feedback(&sig, outcome, CONFIG.reliability_smoothing)
                .await?
            {
                Some((rule_id, reliability)) => {
                    println!("recorded; pattern {rule_id} reliability now {reliability:.3}");
                }
                None => println!("recorded"),
            }
        }
    }

    Ok(())
}
