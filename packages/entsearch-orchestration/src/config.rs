use crate::error::{PipelineError, Result};
use chrono::Utc;
use std::path::PathBuf;

pub const CORPUS_PATH_ENV: &str = "ENTSEARCH_CORPUS_PATH";
pub const SERVING_URL_ENV: &str = "ENTSEARCH_SERVING_URL";
pub const INDEX_ID_ENV: &str = "ENTSEARCH_INDEX_ID";
pub const BINDING_FILE_ENV: &str = "ENTSEARCH_BINDING_FILE";
pub const COMPOSE_FILE_ENV: &str = "ENTSEARCH_COMPOSE_FILE";

pub const DEFAULT_SERVING_URL: &str = "http://localhost:7280";
pub const DEFAULT_BINDING_FILE: &str = "./data/serving.env";

/// Resolution order for every knob: CLI flag, then environment, then default.
fn resolve_str(cli_value: Option<&str>, env_var: &str, default_value: &str) -> String {
    if let Some(value) = cli_value {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Ok(value) = std::env::var(env_var) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    default_value.to_string()
}

fn resolve_optional_str(cli_value: Option<&str>, env_var: &str) -> Option<String> {
    if let Some(value) = cli_value {
        let trimmed = value.trim();
        return if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    if let Ok(value) = std::env::var(env_var) {
        let trimmed = value.trim();
        return if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    None
}

pub fn resolve_corpus_path(cli_value: Option<&str>) -> Result<PathBuf> {
    resolve_optional_str(cli_value, CORPUS_PATH_ENV)
        .map(PathBuf::from)
        .ok_or_else(|| {
            PipelineError::config(format!(
                "no corpus path given; pass --corpus-path or set {CORPUS_PATH_ENV}"
            ))
        })
}

pub fn resolve_serving_url(cli_value: Option<&str>) -> String {
    resolve_str(cli_value, SERVING_URL_ENV, DEFAULT_SERVING_URL)
        .trim_end_matches('/')
        .to_string()
}

/// Index identifiers default to a timestamped name so repeated runs never
/// collide with the currently served index.
pub fn resolve_index_id(cli_value: Option<&str>) -> String {
    resolve_optional_str(cli_value, INDEX_ID_ENV).unwrap_or_else(generate_index_id)
}

pub fn generate_index_id() -> String {
    format!("entities-{}", Utc::now().format("%Y%m%d%H%M%S"))
}

pub fn resolve_binding_file(cli_value: Option<&str>) -> PathBuf {
    PathBuf::from(resolve_str(cli_value, BINDING_FILE_ENV, DEFAULT_BINDING_FILE))
}

pub fn resolve_compose_file(cli_value: Option<&str>) -> Option<PathBuf> {
    resolve_optional_str(cli_value, COMPOSE_FILE_ENV).map(PathBuf::from)
}

/// Numeric tuning knobs shared by the stage argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningConfig {
    /// Record parse limit for smoke runs (0 = no limit).
    pub limit: u64,
    /// Documents per ingest batch.
    pub batch_size: u64,
    /// Max bulk payload bytes per ingest request.
    pub chunk_bytes: u64,
    /// Parallel worker count handed to the stage processes.
    pub workers: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            batch_size: 1000,
            chunk_bytes: 8_000_000,
            workers: default_worker_count(),
        }
    }
}

impl TuningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::config("batch size must be > 0"));
        }
        if self.chunk_bytes == 0 {
            return Err(PipelineError::config("chunk bytes must be > 0"));
        }
        if self.workers == 0 {
            return Err(PipelineError::config("worker count must be > 0"));
        }
        Ok(())
    }
}

pub fn default_worker_count() -> u64 {
    (num_cpus::get() as u64).clamp(1, 8)
}
