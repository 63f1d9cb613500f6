use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use clientmerge_engine::{
    Confirmer, LineConfirmer, MergeConfig, MergeEngine, RunMode, RunStatus, RunSummary,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "clientmerge", version)]
#[command(about = "Find duplicate clients by name and merge them into the most complete record")]
struct Cli {
    /// Print the merge plan and exit without prompting or writing.
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Per-group transaction timeout; overrides CLIENTMERGE_TX_TIMEOUT_SECS.
    #[arg(long)]
    tx_timeout_secs: Option<u64>,

    /// Write merge_plan.json and merge_summary.md under <DIR>/<run id>/.
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> MergeConfig {
        let mut config = MergeConfig::from_env();
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(secs) = self.tx_timeout_secs.filter(|s| *s > 0) {
            config.transaction_timeout_secs = secs;
        }
        if let Some(dir) = &self.report_dir {
            config.reports_dir = Some(dir.clone());
        }
        config
    }

    fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else {
            RunMode::Apply
        }
    }
}

/// Runs a synchronous confirmer off the async worker. Operator prompts are
/// answered from a blocking terminal read while no transaction is open.
struct BlockingConfirmer<C>(C);

impl<C: Confirmer> Confirmer for BlockingConfirmer<C> {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        tokio::task::block_in_place(|| self.0.confirm(prompt))
    }
}

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_VERIFICATION_FAILED: u8 = 2;

/// Skipped groups alone never fail the run; only fatal errors and
/// verification mismatches after an apply do.
fn exit_code(outcome: &Result<RunSummary>) -> u8 {
    match outcome {
        Err(_) => EXIT_FATAL,
        Ok(summary) if summary.status == RunStatus::Applied && !summary.verification_passed() => {
            EXIT_VERIFICATION_FAILED
        }
        Ok(_) => EXIT_OK,
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let config = cli.config();
    let engine = MergeEngine::connect(&config)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let mut confirmer = BlockingConfirmer(LineConfirmer::new(io::stdin().lock(), io::stdout()));
    let mut console = io::stdout();
    let summary = engine.run(cli.mode(), &mut confirmer, &mut console).await?;
    console.flush()?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let outcome = run(Cli::parse()).await;
    match &outcome {
        Ok(summary) => info!(run_id = %summary.run_id, status = ?summary.status, "run finished"),
        Err(err) => eprintln!("clientmerge: {err:#}"),
    }
    ExitCode::from(exit_code(&outcome))
}
