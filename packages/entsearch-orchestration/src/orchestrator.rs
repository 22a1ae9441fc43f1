use crate::error::{PipelineError, Result};
use crate::estimate::{estimate_record_total, SizeEstimate};
use crate::poll::PollBudget;
use crate::readiness::{ReadinessGate, ServiceManager};
use crate::rebind::{BindingStore, ServiceRebinder};
use crate::run::{PipelineRun, RunPhase};
use crate::serving::ServingBackend;
use crate::stage::{Artifact, CommandRunner, StageRunner, StageSpec};
use crate::verify::{GoldenExpectations, GoldenPathVerifier};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything one pipeline execution needs: which services must already be
/// up, the ordered stage list, and how to rebind and verify the serving
/// component afterwards.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub required_services: Vec<String>,
    pub stages: Vec<StageSpec>,
    /// Service-manager name of the serving component to rebind.
    pub serving_component: String,
    /// Identifier of the index artifact this run builds.
    pub index_id: String,
    /// Source corpus, when known, for the advisory size estimate.
    pub corpus_path: Option<PathBuf>,
    /// Record parse limit forwarded to the estimator (0 = no limit).
    pub record_limit: u64,
    /// Literal golden-path expectations; when absent, verification still
    /// gates on health and a non-empty index.
    pub expectations: Option<GoldenExpectations>,
}

/// What a finished run produced, successful or not.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub artifacts: Vec<Artifact>,
    pub estimate: Option<SizeEstimate>,
}

/// Sequences the full control flow: readiness gate, stage runner, serving
/// rebind, golden-path verification. Strictly sequential; the orchestrator
/// does nothing else while a stage runs or a poll sleeps.
pub struct PipelineOrchestrator {
    gate: ReadinessGate,
    stage_runner: StageRunner,
    rebinder: ServiceRebinder,
    verifier: GoldenPathVerifier,
}

impl PipelineOrchestrator {
    pub fn new(
        service_manager: Arc<dyn ServiceManager>,
        command_runner: Arc<dyn CommandRunner>,
        binding_store: Arc<dyn BindingStore>,
        serving_backend: Arc<dyn ServingBackend>,
        poll_budget: PollBudget,
    ) -> Self {
        Self {
            gate: ReadinessGate::new(service_manager.clone()),
            stage_runner: StageRunner::new(command_runner),
            rebinder: ServiceRebinder::new(binding_store, service_manager),
            verifier: GoldenPathVerifier::new(serving_backend, poll_budget),
        }
    }

    /// Execute a run to a terminal state. Failures are returned as a
    /// failed run value (with the phase and failing stage recorded), not
    /// as an `Err`: an `Err` here means the run record itself could not be
    /// driven.
    pub async fn execute(&self, plan: &RunPlan) -> Result<(PipelineRun, RunReport)> {
        let stage_names: Vec<String> = plan.stages.iter().map(|s| s.name.clone()).collect();
        let mut run = PipelineRun::new(plan.index_id.clone(), stage_names);
        let mut report = RunReport::default();

        info!(
            "run {} building index '{}' ({} stages)",
            run.id,
            plan.index_id,
            plan.stages.len()
        );
        run.start()?;

        report.estimate = self.advisory_estimate(plan);

        if let Err(e) = self.gate.require_running(&as_strs(&plan.required_services)).await {
            return self.fail(run, report, RunPhase::Readiness, None, e);
        }

        let stage_result = self
            .stage_runner
            .run_observed(&plan.stages, |name| {
                let _ = run.enter_stage(name);
            })
            .await;
        match stage_result {
            Ok(artifacts) => report.artifacts = artifacts,
            Err(e) => {
                let failed_index = failing_stage_index(&run, &e);
                return self.fail(run, report, RunPhase::Stages, failed_index, e);
            }
        }

        if let Err(e) = self
            .rebinder
            .rebind(&plan.serving_component, &plan.index_id)
            .await
        {
            return self.fail(run, report, RunPhase::Rebind, None, e);
        }

        let verification = match &plan.expectations {
            Some(expectations) => self.verifier.verify(&plan.index_id, expectations).await,
            None => self.verify_minimum(&plan.index_id).await,
        };
        if let Err(e) = verification {
            return self.fail(run, report, RunPhase::Verification, None, e);
        }

        run.complete()?;
        info!(
            "run {} succeeded; serving index '{}' ({} artifacts)",
            run.id,
            plan.index_id,
            report.artifacts.len()
        );
        Ok((run, report))
    }

    /// Size the corpus for progress reporting. Advisory: estimation
    /// failures are logged and ignored.
    fn advisory_estimate(&self, plan: &RunPlan) -> Option<SizeEstimate> {
        let path = plan.corpus_path.as_deref()?;
        match estimate_record_total(path, plan.record_limit) {
            Ok(Some(estimate)) => {
                info!(
                    "corpus {}: ~{} records expected ({} sampled over {} of {} bytes)",
                    path.display(),
                    estimate.estimated_total_records,
                    estimate.sampled_records,
                    estimate.sampled_input_bytes,
                    estimate.total_input_bytes
                );
                Some(estimate)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("could not estimate corpus size: {}", e);
                None
            }
        }
    }

    /// Without literal expectations the golden path still gates on the
    /// serving endpoint being healthy and the new index being non-empty.
    async fn verify_minimum(&self, index_id: &str) -> Result<()> {
        self.verifier.await_healthy().await?;
        let count = self.verifier.await_nonempty_index(index_id).await?;
        info!("index '{}' visible with {} documents", index_id, count);
        Ok(())
    }

    fn fail(
        &self,
        mut run: PipelineRun,
        report: RunReport,
        phase: RunPhase,
        failed_stage_index: Option<usize>,
        cause: PipelineError,
    ) -> Result<(PipelineRun, RunReport)> {
        error!("run {} failed in {} phase: {}", run.id, phase, cause);
        run.fail(phase, failed_stage_index, cause.to_string())?;
        Ok((run, report))
    }
}

fn failing_stage_index(run: &PipelineRun, error: &PipelineError) -> Option<usize> {
    match error {
        PipelineError::StageFailed { stage, .. } | PipelineError::MissingArtifact { stage, .. } => {
            run.stage_index(stage)
        }
        _ => None,
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}
