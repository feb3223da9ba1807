//! Payments ingestion pipeline — operator entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser as ClapParser, Subcommand};
use sqlx::Connection;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use payments_ingestion_pipeline::config::PipelineConfig;
use payments_ingestion_pipeline::context::ProcessorContext;
use payments_ingestion_pipeline::error::PipelineError;
use payments_ingestion_pipeline::offline::OfflineDeriver;
use payments_ingestion_pipeline::processor::Processor;

const EXIT_SUCCESS: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_FAILURE: u8 = 2;
const EXIT_SIGINT: u8 = 130;

#[derive(ClapParser)]
#[command(name = "payments-pipeline", author, version, about, long_about = None)]
struct Cli {
    /// Path to the pipeline's YAML configuration file.
    #[arg(short, long, value_name = "FILE", env = "PIPELINE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the streaming consume loop and the ambient HTTP surface.
    Run,
    /// Publish synthetic traffic. Out of scope for this core.
    Simulate,
    /// Re-derive aggregates for every archived event on `date` (UTC).
    ReplayDate {
        #[arg(value_name = "YYYY-MM-DD")]
        date: String,
    },
    /// Re-derive aggregates for every archived event in `[start, end)` (UTC).
    ReplayRange {
        #[arg(value_name = "YYYY-MM-DD")]
        start: String,
        #[arg(value_name = "YYYY-MM-DD")]
        end: String,
    },
    /// Run the off-line derivation over `[start, end)` and print the result as JSON.
    MetricsDump {
        #[arg(value_name = "YYYY-MM-DD")]
        start: String,
        #[arg(value_name = "YYYY-MM-DD")]
        end: String,
        /// Comma-separated feature list for optional clustering (e.g. "amount,currency_encoded").
        #[arg(long)]
        features: Option<String>,
        /// Clustering algorithm: kmeans:<k>, dbscan:<min_samples>, ward:<k>.
        #[arg(long)]
        cluster: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();

    let config = match load_config(&cli.config).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if matches!(cli.command, Commands::Run) {
        return match run_processor(config).await {
            Ok(Interrupted::Yes) => ExitCode::from(EXIT_SIGINT),
            Ok(Interrupted::No) => ExitCode::from(EXIT_SUCCESS),
            Err(e) => {
                error!(error = %e, "unrecoverable runtime failure");
                ExitCode::from(EXIT_RUNTIME_FAILURE)
            }
        };
    }

    let outcome = match cli.command {
        Commands::Run => unreachable!("handled above"),
        Commands::Simulate => {
            error!("`simulate` publishes synthetic traffic and is not implemented in this core");
            Err(PipelineError::internal("simulate is not implemented in this core"))
        }
        Commands::ReplayDate { date } => replay_date(config, &date).await,
        Commands::ReplayRange { start, end } => replay_range(config, &start, &end).await,
        Commands::MetricsDump { start, end, features, cluster } => {
            metrics_dump(config, &start, &end, features.as_deref(), cluster.as_deref()).await
        }
    };

    match outcome {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!(error = %e, "unrecoverable runtime failure");
            ExitCode::from(EXIT_RUNTIME_FAILURE)
        }
    }
}

/// Whether `run_processor` returned because of SIGINT (exit 130 ) or a
/// normal shutdown sequence.
enum Interrupted {
    Yes,
    No,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn load_config(path: &PathBuf) -> Result<PipelineConfig, PipelineError> {
    let mut config = PipelineConfig::load(path).await?;
    config.overlay_env();
    config.validate()?;
    Ok(config)
}

/// Starts the consume loop and the `/healthz` + `/metrics` HTTP surface as
/// independent tasks, racing both against Ctrl-C and tearing everything down
/// through `ProcessorContext::shutdown` on either signal.
async fn run_processor(config: PipelineConfig) -> Result<Interrupted, PipelineError> {
    let addr = config.server.metrics_http_addr.clone();
    let ctx = ProcessorContext::build(config).await?;
    let processor = Processor::new(ctx.clone());

    let http_shutdown = ctx.shutdown.clone();
    let http_ctx = ctx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = payments_ingestion_pipeline::http::serve(http_ctx, &addr, http_shutdown).await {
            error!(error = %e, "metrics/health HTTP surface exited with an error");
        }
    });

    let processor_task = tokio::spawn(async move { processor.run().await });

    let interrupted = tokio::select! {
        result = processor_task => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "processor exited with an error");
            }
            Interrupted::No
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("received SIGINT, shutting down");
            Interrupted::Yes
        }
    };

    ctx.shutdown().await?;
    let _ = http_task.await;
    Ok(interrupted)
}

fn parse_date(raw: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| PipelineError::InvalidArgument(format!("expected YYYY-MM-DD, got '{raw}': {e}")))
}

async fn replay_date(config: PipelineConfig, date: &str) -> Result<(), PipelineError> {
    let day = parse_date(date)?;
    let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).expect("midnight is valid"));
    let end = start + chrono::Duration::days(1);
    replay(config, start, end).await
}

async fn replay_range(config: PipelineConfig, start: &str, end: &str) -> Result<(), PipelineError> {
    let start_day = parse_date(start)?;
    let end_day = parse_date(end)?;
    let start = Utc.from_utc_datetime(&start_day.and_hms_opt(0, 0, 0).expect("midnight is valid"));
    let end = Utc.from_utc_datetime(&end_day.and_hms_opt(0, 0, 0).expect("midnight is valid"));
    replay(config, start, end).await
}

/// Re-reads archived raw events over `[start, end)` and re-runs them through
/// the same parse → rule-evaluation → transactional-write path the live
/// Processor uses, backfilling `dynamic_metrics` / `payment_metrics_5m` /
/// `aggregate_histograms` for a range the consume loop already processed
/// (or lost, per the crash-recovery invariant). Failures are
/// dead-lettered with reason `replay_error` rather than aborting the batch.
async fn replay(config: PipelineConfig, start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> Result<(), PipelineError> {
    let ctx = ProcessorContext::build(config).await?;
    let events = ctx.archive_reader.get_by_range(start, end).await?;
    info!(count = events.len(), %start, %end, "replaying archived events");

    let mut replayed = 0u64;
    let mut failed = 0u64;

    for event in events {
        let body = serde_json::to_vec(&event.payload).unwrap_or_default();
        let outcome = ctx.parser.parse(&body, None);
        let transaction = match outcome {
            payments_ingestion_pipeline::model::ParseOutcome::Parsed { transaction, .. } => *transaction,
            payments_ingestion_pipeline::model::ParseOutcome::Rejected { .. } => {
                failed += 1;
                continue;
            }
        };

        let derived = ctx.rule_engine.evaluate(&transaction);
        let result = write_once(&ctx, &transaction, &derived).await;
        match result {
            Ok(()) => replayed += 1,
            Err(e) => {
                failed += 1;
                let item = payments_ingestion_pipeline::model::FailedItem {
                    transaction_id: Some(transaction.transaction_id.clone()),
                    correlation_id: Some(transaction.correlation_id.clone()),
                    error_tag: "replay_error".to_string(),
                    error_message: e.to_string(),
                    raw_payload: event.payload,
                    failed_at: Utc::now(),
                };
                ctx.dead_letter.write(item).await?;
            }
        }
    }

    info!(replayed, failed, "replay complete");
    ctx.shutdown().await
}

async fn write_once(
    ctx: &Arc<ProcessorContext>,
    tx: &payments_ingestion_pipeline::model::Transaction,
    derived: &[payments_ingestion_pipeline::model::DerivedMetric],
) -> Result<(), PipelineError> {
    let mut conn = ctx.pool.acquire().await?;
    let mut db_tx = conn.as_mut().begin().await.map_err(PipelineError::Database)?;
    let correlation_id = uuid::Uuid::new_v4();

    match ctx.aggregate_writer.write_transaction_metrics(&mut db_tx, tx, correlation_id, derived).await {
        Ok(()) => {
            db_tx.commit().await.map_err(PipelineError::Database)?;
            conn.release(false).await;
            Ok(())
        }
        Err(e) => {
            let _ = db_tx.rollback().await;
            conn.release(true).await;
            Err(e)
        }
    }
}

async fn metrics_dump(
    config: PipelineConfig,
    start: &str,
    end: &str,
    features: Option<&str>,
    cluster: Option<&str>,
) -> Result<(), PipelineError> {
    let start_day = parse_date(start)?;
    let end_day = parse_date(end)?;
    let start = Utc.from_utc_datetime(&start_day.and_hms_opt(0, 0, 0).expect("midnight is valid"));
    let end = Utc.from_utc_datetime(&end_day.and_hms_opt(0, 0, 0).expect("midnight is valid"));

    let ctx = ProcessorContext::build(config).await?;
    let deriver = OfflineDeriver::new(ctx.archive_reader.clone(), ctx.parser.clone());

    let parsed_features: Vec<payments_ingestion_pipeline::offline::Feature> = features
        .map(|f| f.split(',').filter_map(payments_ingestion_pipeline::offline::Feature::parse).collect())
        .unwrap_or_default();

    let algorithm = cluster.and_then(parse_cluster_spec);

    let result = deriver.derive_window(start, end, &parsed_features, algorithm).await?;
    let rendered = serde_json::to_string_pretty(&result).map_err(PipelineError::Serialization)?;
    println!("{rendered}");
    ctx.shutdown().await
}

fn parse_cluster_spec(raw: &str) -> Option<payments_ingestion_pipeline::offline::ClusterAlgorithm> {
    let (kind, arg) = raw.split_once(':')?;
    let n: usize = arg.parse().ok()?;
    match kind {
        "kmeans" => Some(payments_ingestion_pipeline::offline::ClusterAlgorithm::KMeans { k: n }),
        "dbscan" => Some(payments_ingestion_pipeline::offline::ClusterAlgorithm::Dbscan { min_samples: n }),
        "ward" => Some(payments_ingestion_pipeline::offline::ClusterAlgorithm::AgglomerativeWard { k: n }),
        _ => None,
    }
}
