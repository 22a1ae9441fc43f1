//! Entity-search pipeline CLI.
//!
//! Thin wrapper over `entsearch-orchestration`: resolves configuration
//! (flag -> env var -> default), builds the stage plan, and maps the run
//! outcome to an exit code. Exit code 0 means every stage exited zero AND
//! verification passed; anything else is 1.

use clap::Parser;
use entsearch_orchestration::{
    config, ArgToken, Artifact, ComposeManager, EnvFileBindingStore, FilteredExpectation,
    GoldenExpectations, PipelineOrchestrator, PollBudget, ProcessRunner, RunPlan, RunStatus,
    SearchRequest, ServingClient, StageSpec, TuningConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Run the entity-search indexing pipeline end to end: extract corpus
/// metadata, shape index documents, ingest them, rebind the serving
/// component, and verify the result.
#[derive(Parser, Debug)]
#[command(name = "entsearch")]
#[command(version = "0.1.0")]
#[command(about = "Build and serve a fresh entity-search index from a corpus dump")]
struct Cli {
    /// Input corpus path (.json or .json.gz).
    #[arg(long)]
    corpus_path: Option<String>,

    /// Identifier for the produced index (default: timestamped).
    #[arg(long)]
    index_id: Option<String>,

    /// Serving endpoint base URL.
    #[arg(long)]
    serving_url: Option<String>,

    /// Env file the serving component reads its active index from.
    #[arg(long)]
    binding_file: Option<String>,

    /// Compose file for the service manager (default: compose's own lookup).
    #[arg(long)]
    compose_file: Option<String>,

    /// Directory stage artifacts are written to.
    #[arg(long, default_value = "./data/work")]
    work_dir: PathBuf,

    /// Service-manager name of the serving component.
    #[arg(long, default_value = "serving")]
    serving_component: String,

    /// Required background services checked before any stage runs.
    #[arg(long, value_delimiter = ',', default_value = "serving,storage")]
    require_services: Vec<String>,

    /// Record parse limit for smoke runs (0 = no limit).
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// Documents per ingest batch.
    #[arg(long, default_value_t = 1000)]
    batch_size: u64,

    /// Max bulk payload bytes per ingest request.
    #[arg(long, default_value_t = 8_000_000)]
    chunk_bytes: u64,

    /// Parallel worker count handed to the stage processes.
    #[arg(long)]
    workers: Option<u64>,

    /// How long to wait on each readiness condition, in seconds.
    #[arg(long, default_value_t = 120.0)]
    wait_timeout_seconds: f64,

    /// Polling interval between readiness probes, in seconds.
    #[arg(long, default_value_t = 2.0)]
    poll_interval_seconds: f64,

    /// HTTP timeout per serving-endpoint request, in seconds.
    #[arg(long, default_value_t = 30.0)]
    http_timeout_seconds: f64,

    /// Golden-path probe query text (enables the query assertions).
    #[arg(long)]
    verify_query: Option<String>,

    /// Minimum hits the probe query must return.
    #[arg(long, default_value_t = 1)]
    verify_min_hits: u64,

    /// Entity id expected as the probe query's top hit.
    #[arg(long)]
    verify_top_hit: Option<String>,

    /// Coarse type filter for the exact-count follow-up query.
    #[arg(long)]
    verify_filter_type: Option<String>,

    /// Exact hit count the filtered follow-up query must return.
    #[arg(long)]
    verify_filtered_hits: Option<u64>,

    /// Verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn build_stages(
    corpus_path: &Path,
    work_dir: &Path,
    serving_url: &str,
    index_id: &str,
    tuning: &TuningConfig,
) -> Vec<StageSpec> {
    let metadata_path = work_dir.join("metadata.jsonl.gz");
    let docs_path = work_dir.join("index_docs.jsonl.gz");

    vec![
        StageSpec {
            name: "metadata-extract".to_string(),
            program: "entsearch-extract".to_string(),
            args: vec![
                ArgToken::lit("--corpus"),
                ArgToken::lit(corpus_path.display().to_string()),
                ArgToken::lit("--output"),
                ArgToken::artifact("metadata"),
                ArgToken::lit("--limit"),
                ArgToken::lit(tuning.limit.to_string()),
                ArgToken::lit("--workers"),
                ArgToken::lit(tuning.workers.to_string()),
            ],
            consumes: vec![],
            produces: vec![Artifact::new("metadata", &metadata_path)],
        },
        StageSpec {
            name: "document-shape".to_string(),
            program: "entsearch-shape".to_string(),
            args: vec![
                ArgToken::lit("--metadata"),
                ArgToken::artifact("metadata"),
                ArgToken::lit("--output"),
                ArgToken::artifact("documents"),
                ArgToken::lit("--batch-size"),
                ArgToken::lit(tuning.batch_size.to_string()),
                ArgToken::lit("--workers"),
                ArgToken::lit(tuning.workers.to_string()),
            ],
            consumes: vec!["metadata".to_string()],
            produces: vec![Artifact::new("documents", &docs_path)],
        },
        StageSpec {
            name: "index-ingest".to_string(),
            program: "entsearch-ingest".to_string(),
            args: vec![
                ArgToken::lit("--documents"),
                ArgToken::artifact("documents"),
                ArgToken::lit("--serving-url"),
                ArgToken::lit(serving_url.to_string()),
                ArgToken::lit("--index-id"),
                ArgToken::lit(index_id.to_string()),
                ArgToken::lit("--chunk-bytes"),
                ArgToken::lit(tuning.chunk_bytes.to_string()),
            ],
            consumes: vec!["documents".to_string()],
            produces: vec![],
        },
    ]
}

fn build_expectations(cli: &Cli) -> Option<GoldenExpectations> {
    let query = cli.verify_query.as_deref()?;

    let filtered = match (&cli.verify_filter_type, cli.verify_filtered_hits) {
        (Some(filter_type), Some(expected_hits)) => Some(FilteredExpectation {
            request: SearchRequest {
                text: query.to_string(),
                coarse_types: vec![filter_type.clone()],
                fine_types: vec![],
                max_hits: 20,
            },
            expected_hits,
        }),
        _ => None,
    };

    Some(GoldenExpectations {
        probe: SearchRequest::text_only(query, 20),
        min_hits: cli.verify_min_hits,
        top_hit_id: cli.verify_top_hit.clone(),
        filtered,
    })
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let corpus_path = config::resolve_corpus_path(cli.corpus_path.as_deref())?;
    let serving_url = config::resolve_serving_url(cli.serving_url.as_deref());
    let index_id = config::resolve_index_id(cli.index_id.as_deref());
    let binding_file = config::resolve_binding_file(cli.binding_file.as_deref());
    let compose_file = config::resolve_compose_file(cli.compose_file.as_deref());

    let tuning = TuningConfig {
        limit: cli.limit,
        batch_size: cli.batch_size,
        chunk_bytes: cli.chunk_bytes,
        workers: cli.workers.unwrap_or_else(config::default_worker_count),
    };
    tuning.validate()?;

    std::fs::create_dir_all(&cli.work_dir)?;

    let poll_budget = PollBudget::from_window(
        Duration::from_secs_f64(cli.wait_timeout_seconds.max(0.0)),
        Duration::from_secs_f64(cli.poll_interval_seconds.max(0.0)),
    );
    let serving_client = ServingClient::new(
        &serving_url,
        Duration::from_secs_f64(cli.http_timeout_seconds.max(1.0)),
    )?;

    let orchestrator = PipelineOrchestrator::new(
        Arc::new(ComposeManager::new(compose_file)),
        Arc::new(ProcessRunner),
        Arc::new(EnvFileBindingStore::new(binding_file)),
        Arc::new(serving_client),
        poll_budget,
    );

    let plan = RunPlan {
        required_services: cli.require_services.clone(),
        stages: build_stages(&corpus_path, &cli.work_dir, &serving_url, &index_id, &tuning),
        serving_component: cli.serving_component.clone(),
        index_id: index_id.clone(),
        corpus_path: Some(corpus_path),
        record_limit: cli.limit,
        expectations: build_expectations(&cli),
    };

    let (run, report) = orchestrator.execute(&plan).await?;

    match &run.status {
        RunStatus::Succeeded { duration_ms, .. } => {
            info!(
                "pipeline succeeded: index '{}' live after {}ms ({} artifacts)",
                index_id,
                duration_ms,
                report.artifacts.len()
            );
            println!("Pipeline completed successfully; serving index '{index_id}'.");
            Ok(0)
        }
        RunStatus::Failed {
            phase,
            failed_stage_index,
            error: cause,
            ..
        } => {
            let stage_detail = failed_stage_index
                .and_then(|i| run.stage_names.get(i))
                .map(|name| format!(" (stage '{name}')"))
                .unwrap_or_default();
            error!("pipeline failed in {} phase{}: {}", phase, stage_detail, cause);
            eprintln!("ERROR: pipeline failed in {phase} phase{stage_detail}: {cause}");
            Ok(1)
        }
        other => {
            error!("pipeline ended in unexpected state '{}'", other.state_name());
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("pipeline aborted: {e:#}");
            eprintln!("ERROR: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_plan_threads_artifacts() {
        let tuning = TuningConfig::default();
        let stages = build_stages(
            Path::new("/data/corpus.json.gz"),
            Path::new("/data/work"),
            "http://localhost:7280",
            "entities-x",
            &tuning,
        );

        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].name, "metadata-extract");
        assert!(stages[1].consumes.contains(&"metadata".to_string()));
        assert!(stages[2].consumes.contains(&"documents".to_string()));
        assert!(stages[2]
            .args
            .contains(&ArgToken::lit("entities-x")));
    }

    #[test]
    fn test_expectations_require_probe_query() {
        let cli = Cli::parse_from(["entsearch", "--corpus-path", "/tmp/corpus.json"]);
        assert!(build_expectations(&cli).is_none());

        let cli = Cli::parse_from([
            "entsearch",
            "--corpus-path",
            "/tmp/corpus.json",
            "--verify-query",
            "apple",
            "--verify-min-hits",
            "2",
            "--verify-top-hit",
            "Q312",
            "--verify-filter-type",
            "ORGANIZATION",
            "--verify-filtered-hits",
            "1",
        ]);
        let expectations = build_expectations(&cli).unwrap();
        assert_eq!(expectations.min_hits, 2);
        assert_eq!(expectations.top_hit_id.as_deref(), Some("Q312"));
        let filtered = expectations.filtered.unwrap();
        assert_eq!(filtered.expected_hits, 1);
        assert_eq!(filtered.request.coarse_types, vec!["ORGANIZATION"]);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["entsearch"]);
        assert_eq!(cli.require_services, vec!["serving", "storage"]);
        assert_eq!(cli.batch_size, 1000);
        assert_eq!(cli.chunk_bytes, 8_000_000);
        assert_eq!(cli.wait_timeout_seconds, 120.0);
        assert_eq!(cli.poll_interval_seconds, 2.0);
    }
}
