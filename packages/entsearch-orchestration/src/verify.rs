use crate::error::{PipelineError, Result};
use crate::poll::{poll, PollBudget, PollOutcome};
use crate::serving::{hit_id, SearchRequest, SearchResponse, ServingBackend};
use std::sync::Arc;
use tracing::info;

/// Literal expectations asserted against the live serving endpoint after a
/// pipeline run. The probe query and its outcomes are fixed per
/// deployment so that every successful run reproduces them exactly.
#[derive(Debug, Clone)]
pub struct GoldenExpectations {
    /// Unfiltered probe query.
    pub probe: SearchRequest,
    /// Minimum hit count the probe must return.
    pub min_hits: u64,
    /// Identity of the top-ranked hit, when pinned.
    pub top_hit_id: Option<String>,
    /// Optional type-filtered follow-up with an exact expected count.
    pub filtered: Option<FilteredExpectation>,
}

#[derive(Debug, Clone)]
pub struct FilteredExpectation {
    pub request: SearchRequest,
    pub expected_hits: u64,
}

/// Confirms service health, index visibility, and query answerability via
/// bounded polls, then runs the literal assertions. Every failure carries
/// the last observed payload so it is diagnosable without a rerun.
pub struct GoldenPathVerifier {
    backend: Arc<dyn ServingBackend>,
    budget: PollBudget,
}

impl GoldenPathVerifier {
    pub fn new(backend: Arc<dyn ServingBackend>, budget: PollBudget) -> Self {
        Self { backend, budget }
    }

    /// Wait until the serving endpoint answers its health check.
    pub async fn await_healthy(&self) -> Result<()> {
        let backend = self.backend.clone();
        poll("serving health", self.budget, move || {
            let backend = backend.clone();
            async move {
                match backend.health().await {
                    Ok(true) => PollOutcome::Ready(()),
                    Ok(false) => PollOutcome::NotYet,
                    Err(e) => PollOutcome::TransientError(e.to_string()),
                }
            }
        })
        .await
    }

    /// Wait until the index exists and reports a nonzero document count.
    /// "Ready" deliberately means count > 0 and nothing stronger: the
    /// serving service exposes no completion signal at this boundary.
    pub async fn await_nonempty_index(&self, index_id: &str) -> Result<u64> {
        let backend = self.backend.clone();
        let index_id = index_id.to_string();
        poll("non-empty index", self.budget, move || {
            let backend = backend.clone();
            let index_id = index_id.clone();
            async move {
                match backend.doc_count(&index_id).await {
                    Ok(Some(count)) if count > 0 => PollOutcome::Ready(count),
                    Ok(Some(_)) => PollOutcome::NotYet,
                    Ok(None) => PollOutcome::TransientError(format!(
                        "index '{index_id}' does not exist yet"
                    )),
                    Err(e) => PollOutcome::TransientError(e.to_string()),
                }
            }
        })
        .await
    }

    /// Wait until the probe query returns a well-formed response with at
    /// least `min_hits` entries.
    pub async fn await_answerable(
        &self,
        index_id: &str,
        probe: &SearchRequest,
        min_hits: u64,
    ) -> Result<SearchResponse> {
        let backend = self.backend.clone();
        let index_id = index_id.to_string();
        let probe = probe.clone();
        poll("query answerable", self.budget, move || {
            let backend = backend.clone();
            let index_id = index_id.clone();
            let probe = probe.clone();
            async move {
                match backend.search(&index_id, &probe).await {
                    Ok(response) if (response.hits.len() as u64) >= min_hits => {
                        PollOutcome::Ready(response)
                    }
                    Ok(response) => PollOutcome::TransientError(format!(
                        "probe returned {} hits, expected at least {min_hits}",
                        response.hits.len()
                    )),
                    Err(e) => PollOutcome::TransientError(e.to_string()),
                }
            }
        })
        .await
    }

    /// Full golden path: health, non-empty index, answerable probe, then
    /// the literal assertions.
    pub async fn verify(&self, index_id: &str, expectations: &GoldenExpectations) -> Result<()> {
        self.await_healthy().await?;

        let count = self.await_nonempty_index(index_id).await?;
        info!("index '{}' visible with {} documents", index_id, count);

        let response = self
            .await_answerable(index_id, &expectations.probe, expectations.min_hits)
            .await?;

        if let Some(expected_top) = &expectations.top_hit_id {
            let actual_top = response.hits.first().and_then(hit_id);
            if actual_top != Some(expected_top.as_str()) {
                return Err(verification_failure(
                    format!(
                        "top hit mismatch: expected '{}', got '{}'",
                        expected_top,
                        actual_top.unwrap_or("<none>")
                    ),
                    &response,
                ));
            }
        }

        if let Some(filtered) = &expectations.filtered {
            let filtered_response = self.backend.search(index_id, &filtered.request).await?;
            let returned = filtered_response.hits.len() as u64;
            if returned != filtered.expected_hits {
                return Err(verification_failure(
                    format!(
                        "filtered query returned {} hits, expected exactly {}",
                        returned, filtered.expected_hits
                    ),
                    &filtered_response,
                ));
            }
        }

        info!("golden-path verification passed for index '{}'", index_id);
        Ok(())
    }
}

fn verification_failure(detail: String, payload: &SearchResponse) -> PipelineError {
    let observed = serde_json::to_string(payload)
        .unwrap_or_else(|_| "<payload not serializable>".to_string());
    PipelineError::VerificationFailed(format!("{detail}; last payload: {observed}"))
}
