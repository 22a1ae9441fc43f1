/*
 * Entsearch Orchestration - pipeline control plane
 *
 * Sequences the batch indexing pipeline for the entity-search service:
 * readiness gating, sequential external stage execution, serving rebind,
 * and end-to-end verification against the live query endpoint.
 *
 * Architecture:
 * - Readiness Gate (point-in-time service check)
 * - Stage Runner (fail-fast sequential external processes)
 * - Polling Verifier (bounded fixed-interval readiness waits)
 * - Service Rebind (atomic serving reconfiguration)
 * - Golden-Path Verifier (health, index visibility, query assertions)
 * - Progress Estimator (bounded-sample corpus sizing)
 */

// Public modules
pub mod config;
pub mod error;
pub mod estimate;
pub mod orchestrator;
pub mod poll;
pub mod readiness;
pub mod rebind;
pub mod run;
pub mod serving;
pub mod stage;
pub mod verify;

// Re-exports
pub use config::TuningConfig;
pub use error::{PipelineError, Result};
pub use estimate::{estimate_record_total, SizeEstimate};
pub use orchestrator::{PipelineOrchestrator, RunPlan, RunReport};
pub use poll::{poll, PollBudget, PollOutcome};
pub use readiness::{ComposeManager, ReadinessGate, ServiceManager};
pub use rebind::{BindingStore, EnvFileBindingStore, InMemoryBindingStore, ServiceRebinder};
pub use run::{PipelineRun, RunPhase, RunStatus};
pub use serving::{
    build_search_query, hit_id, SearchRequest, SearchResponse, ServingBackend, ServingClient,
};
pub use stage::{ArgToken, Artifact, CommandOutcome, CommandRunner, ProcessRunner, StageRunner, StageSpec};
pub use verify::{FilteredExpectation, GoldenExpectations, GoldenPathVerifier};
