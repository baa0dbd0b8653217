mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use surge_core::app::{
    BatchRun, ClaimCoordinator, ConfigError, JsonlBatchProcessor, JsonlTotals, RunError,
    RunReport, SurgeConfig, SweepReport,
};
use surge_core::domain::{ItemStatus, ServiceError, Stage, TrackedItem};
use surge_core::impls::{HttpService, InMemoryEntityStore, LocalBlobStore, SimulatedService};
use surge_core::ports::{
    BlobError, BlobStore, Clock, EntityStore, ExternalService, IdGenerator, StoreError,
    SystemClock, UlidGenerator,
};

#[derive(Debug, Parser)]
#[command(name = "surge", version, about = "Adaptive bulk dispatch against a rate-limited service")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "SURGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Claim and process every artifact under the trigger prefix of a directory.
    Claim(ClaimArgs),

    /// Run an in-memory batch through the full pipeline against a simulated service.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct ClaimArgs {
    /// Root directory of the shared object store.
    #[arg(long, env = "SURGE_ROOT")]
    root: PathBuf,

    /// Worker id; processing copies live under `<processing_prefix><worker>/`.
    #[arg(long, env = "SURGE_WORKER")]
    worker: String,

    /// JSON config file.
    #[arg(long, env = "SURGE_CONFIG")]
    config: Option<PathBuf>,

    /// Service endpoint; without it a simulated service answers.
    #[arg(long, env = "SURGE_ENDPOINT")]
    endpoint: Option<String>,

    /// Per-request timeout.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Number of items to seed.
    #[arg(long, default_value_t = 1000)]
    items: usize,

    #[arg(long, default_value = "classify")]
    stage: String,

    /// JSON config file.
    #[arg(long, env = "SURGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 0.01)]
    rate_limit: f64,

    #[arg(long, default_value_t = 0.02)]
    transient: f64,

    #[arg(long, default_value_t = 0.005)]
    unrecoverable: f64,

    #[arg(long, default_value_t = 5)]
    latency_ms: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("failed to encode summary: {0}")]
    Summary(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct ClaimSummary<'a> {
    worker: &'a str,
    sweep: &'a SweepReport,
    totals: JsonlTotals,
}

#[derive(Serialize)]
struct SimulateSummary<'a> {
    runs: &'a [RunReport],
    completed: usize,
    terminal: usize,
    eligible: usize,
}

async fn load_config(path: Option<&Path>) -> Result<SurgeConfig, ConfigError> {
    match path {
        Some(path) => SurgeConfig::from_file(path).await,
        None => Ok(SurgeConfig::default()),
    }
}

async fn claim(args: ClaimArgs) -> Result<ExitCode, CliError> {
    let config = load_config(args.config.as_deref()).await?;

    let service: Arc<dyn ExternalService> = match &args.endpoint {
        Some(endpoint) => Arc::new(HttpService::new(
            endpoint.clone(),
            Duration::from_secs(args.timeout_secs),
        )?),
        None => Arc::new(SimulatedService::default()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&args.root));

    let processor = JsonlBatchProcessor::new(
        Arc::clone(&store),
        service,
        ids,
        clock,
        config.dispatch.clone(),
    );
    let coordinator = ClaimCoordinator::new(store, config.claim.clone(), args.worker);
    let sweep = coordinator.sweep(&processor).await?;

    let summary = ClaimSummary {
        worker: coordinator.worker_id(),
        sweep: &sweep,
        totals: processor.totals(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if sweep.has_failures() {
        error!(
            failed = sweep.failed.len(),
            orphaned = sweep.orphaned.len(),
            "sweep finished with failed artifacts"
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn simulate(args: SimulateArgs) -> Result<ExitCode, CliError> {
    let config = load_config(args.config.as_deref()).await?;
    let stage = Stage::new(args.stage);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids = Arc::new(UlidGenerator::new(SystemClock));

    let store = Arc::new(InMemoryEntityStore::with_clock(Arc::clone(&clock)));
    let now = clock.now();
    let items: Vec<TrackedItem> = (0..args.items)
        .map(|n| {
            TrackedItem::new(
                ids.item_id(),
                stage.clone(),
                serde_json::json!({ "n": n }),
                config.escalation.max_attempts,
                now,
            )
        })
        .collect();
    store.insert(items).await?;

    let service = SimulatedService {
        rate_limit_probability: args.rate_limit,
        transient_probability: args.transient,
        unrecoverable_probability: args.unrecoverable,
        latency_ms: args.latency_ms,
    };
    let max_passes = config.escalation.max_attempts as usize + 1;
    let run = BatchRun::new(store.clone(), Arc::new(service), ids, clock, config)?;

    // Each pass re-selects the recycled items; every item is completed or
    // terminal after at most max_attempts passes.
    let mut reports = Vec::new();
    for _ in 0..max_passes {
        let report = run.run(&stage, None).await?;
        if report.selected == 0 {
            break;
        }
        reports.push(report);
    }

    let counts = store.status_counts().await;
    let count = |status: &ItemStatus| counts.get(status).copied().unwrap_or(0);
    let summary = SimulateSummary {
        runs: &reports,
        completed: count(&ItemStatus::Completed(stage.clone())),
        terminal: count(&ItemStatus::TerminalFailure),
        eligible: count(&ItemStatus::Eligible(stage.clone())),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        completed = summary.completed,
        terminal = summary.terminal,
        "simulation finished"
    );

    if summary.terminal > 0 || summary.eligible > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    let result = match cli.command {
        Command::Claim(args) => claim(args).await,
        Command::Simulate(args) => simulate(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_claim_arguments() {
        let cli = Cli::try_parse_from([
            "surge", "claim", "--root", "/data", "--worker", "w1", "--endpoint", "http://svc/call",
        ])
        .unwrap();
        match cli.command {
            Command::Claim(args) => {
                assert_eq!(args.root, PathBuf::from("/data"));
                assert_eq!(args.worker, "w1");
                assert_eq!(args.endpoint.as_deref(), Some("http://svc/call"));
                assert_eq!(args.timeout_secs, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn claim_requires_a_worker() {
        assert!(Cli::try_parse_from(["surge", "claim", "--root", "/data"]).is_err());
    }

    #[tokio::test]
    async fn simulate_with_reliable_service_succeeds() {
        let args = SimulateArgs {
            items: 50,
            stage: "classify".into(),
            config: None,
            rate_limit: 0.0,
            transient: 0.0,
            unrecoverable: 0.0,
            latency_ms: 0,
        };
        assert_eq!(simulate(args).await.unwrap(), ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn claim_processes_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(
            incoming.join("batch_17.jsonl"),
            "{\"external_id\":\"a\",\"payload\":{\"n\":1}}\n",
        )
        .unwrap();

        let args = ClaimArgs {
            root: dir.path().to_path_buf(),
            worker: "w1".into(),
            config: None,
            endpoint: None,
            timeout_secs: 1,
        };
        // the default simulated service may fail the one line; the artifact is
        // still processed
        claim(args).await.unwrap();
        assert!(dir.path().join("results/batch_17.jsonl").is_file());
        assert!(!incoming.join("batch_17.jsonl").exists());
    }
}
