use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Max bytes of captured stderr kept for the failure report.
const STDERR_TAIL_BYTES: usize = 4_000;

/// One token of a stage's argument template. Artifact references resolve
/// against the run's artifact map, never by positional interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgToken {
    Lit(String),
    Artifact(String),
}

impl ArgToken {
    pub fn lit(value: impl Into<String>) -> Self {
        ArgToken::Lit(value.into())
    }

    pub fn artifact(name: impl Into<String>) -> Self {
        ArgToken::Artifact(name.into())
    }
}

/// A named file an external stage produces for later stages to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Declaration of one external stage invocation.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<ArgToken>,
    /// Artifact names this stage reads; each must exist non-empty before
    /// the stage starts.
    pub consumes: Vec<String>,
    /// Artifacts this stage must leave behind; each must exist non-empty
    /// after a zero exit.
    pub produces: Vec<Artifact>,
}

/// Captured result of one external process.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stderr_tail: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam for launching stage processes, so tests can simulate exit codes
/// without spawning anything.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome>;
}

/// Real launcher: spawns the process, blocks until exit, captures stderr.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(CommandOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stderr_tail: tail_of(&stderr, STDERR_TAIL_BYTES),
        })
    }
}

fn tail_of(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn artifact_is_ready(path: &Path) -> bool {
    std::fs::metadata(path).map_or(false, |meta| meta.is_file() && meta.len() > 0)
}

/// Executes an ordered stage list strictly in sequence, threading produced
/// artifacts forward and aborting on the first non-zero exit.
pub struct StageRunner {
    command_runner: Arc<dyn CommandRunner>,
}

impl StageRunner {
    pub fn new(command_runner: Arc<dyn CommandRunner>) -> Self {
        Self { command_runner }
    }

    /// Run every stage in order. On success returns the full ordered list
    /// of produced artifacts; on the first failure, later stages never
    /// start and the failing stage's name, exit code, and stderr tail are
    /// reported.
    pub async fn run(&self, stages: &[StageSpec]) -> Result<Vec<Artifact>> {
        self.run_observed(stages, |_| {}).await
    }

    /// `run`, notifying `on_stage_start` before each stage launches (used
    /// to keep the run record's current stage up to date).
    pub async fn run_observed<F>(&self, stages: &[StageSpec], mut on_stage_start: F) -> Result<Vec<Artifact>>
    where
        F: FnMut(&str),
    {
        let mut known: HashMap<String, PathBuf> = HashMap::new();
        let mut produced: Vec<Artifact> = Vec::new();

        for stage in stages {
            on_stage_start(&stage.name);
            self.check_inputs(stage, &known)?;
            let args = resolve_args(stage, &known)?;

            info!("stage '{}': {} {}", stage.name, stage.program, args.join(" "));
            let started = Instant::now();
            let outcome = self.command_runner.run(&stage.program, &args).await?;
            let elapsed_ms = started.elapsed().as_millis();

            if !outcome.success() {
                warn!(
                    "stage '{}' failed with exit code {} after {}ms",
                    stage.name, outcome.exit_code, elapsed_ms
                );
                return Err(PipelineError::StageFailed {
                    stage: stage.name.clone(),
                    code: outcome.exit_code,
                    stderr_tail: outcome.stderr_tail,
                });
            }

            // A zero exit is not enough: declared outputs must exist and be
            // non-empty before any later stage may observe them.
            for artifact in &stage.produces {
                if !artifact_is_ready(&artifact.path) {
                    return Err(PipelineError::MissingArtifact {
                        stage: stage.name.clone(),
                        artifact: artifact.name.clone(),
                        path: artifact.path.display().to_string(),
                    });
                }
                known.insert(artifact.name.clone(), artifact.path.clone());
                produced.push(artifact.clone());
            }

            info!(
                "stage '{}' completed in {}ms ({} artifact{})",
                stage.name,
                elapsed_ms,
                stage.produces.len(),
                if stage.produces.len() == 1 { "" } else { "s" }
            );
        }

        Ok(produced)
    }

    fn check_inputs(&self, stage: &StageSpec, known: &HashMap<String, PathBuf>) -> Result<()> {
        for name in &stage.consumes {
            let path = known.get(name).ok_or_else(|| {
                PipelineError::config(format!(
                    "stage '{}' consumes undeclared artifact '{}'",
                    stage.name, name
                ))
            })?;
            if !artifact_is_ready(path) {
                return Err(PipelineError::MissingArtifact {
                    stage: stage.name.clone(),
                    artifact: name.clone(),
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Substitute artifact references in the argument template. A stage may
/// reference artifacts it consumes or ones it is about to produce.
fn resolve_args(stage: &StageSpec, known: &HashMap<String, PathBuf>) -> Result<Vec<String>> {
    stage
        .args
        .iter()
        .map(|token| match token {
            ArgToken::Lit(value) => Ok(value.clone()),
            ArgToken::Artifact(name) => {
                if let Some(path) = known.get(name) {
                    return Ok(path.display().to_string());
                }
                if let Some(own) = stage.produces.iter().find(|a| &a.name == name) {
                    return Ok(own.path.display().to_string());
                }
                Err(PipelineError::config(format!(
                    "stage '{}' references unknown artifact '{}' in its arguments",
                    stage.name, name
                )))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    /// Scripted runner: records invocations, returns canned exit codes,
    /// and materializes the artifacts a "stage" would have written.
    struct ScriptedRunner {
        exit_codes: HashMap<String, i32>,
        materialize: HashMap<String, Vec<PathBuf>>,
        invocations: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                exit_codes: HashMap::new(),
                materialize: HashMap::new(),
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn invoked_programs(&self) -> Vec<String> {
            self.invocations
                .lock()
                .iter()
                .map(|(program, _)| program.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
            self.invocations
                .lock()
                .push((program.to_string(), args.to_vec()));

            for path in self.materialize.get(program).into_iter().flatten() {
                let mut file = std::fs::File::create(path)?;
                writeln!(file, "artifact written by {program}")?;
            }

            let code = self.exit_codes.get(program).copied().unwrap_or(0);
            Ok(CommandOutcome {
                exit_code: code,
                stderr_tail: if code == 0 {
                    String::new()
                } else {
                    format!("{program}: simulated failure")
                },
            })
        }
    }

    fn two_stage_plan(dir: &Path) -> Vec<StageSpec> {
        let meta_path = dir.join("metadata.jsonl");
        let docs_path = dir.join("docs.jsonl");
        vec![
            StageSpec {
                name: "metadata-extract".to_string(),
                program: "extract".to_string(),
                args: vec![
                    ArgToken::lit("--output"),
                    ArgToken::artifact("metadata"),
                ],
                consumes: vec![],
                produces: vec![Artifact::new("metadata", &meta_path)],
            },
            StageSpec {
                name: "document-shape".to_string(),
                program: "shape".to_string(),
                args: vec![
                    ArgToken::lit("--metadata"),
                    ArgToken::artifact("metadata"),
                    ArgToken::lit("--output"),
                    ArgToken::artifact("documents"),
                ],
                consumes: vec!["metadata".to_string()],
                produces: vec![Artifact::new("documents", &docs_path)],
            },
        ]
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_thread_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let stages = two_stage_plan(dir.path());

        let mut runner = ScriptedRunner::new();
        runner.materialize.insert(
            "extract".to_string(),
            vec![dir.path().join("metadata.jsonl")],
        );
        runner
            .materialize
            .insert("shape".to_string(), vec![dir.path().join("docs.jsonl")]);
        let runner = Arc::new(runner);

        let artifacts = StageRunner::new(runner.clone()).run(&stages).await.unwrap();

        assert_eq!(runner.invoked_programs(), vec!["extract", "shape"]);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "metadata");
        assert_eq!(artifacts[1].name, "documents");

        // The second stage received the first stage's artifact path.
        let invocations = runner.invocations.lock();
        let shape_args = &invocations[1].1;
        assert!(shape_args.contains(&dir.path().join("metadata.jsonl").display().to_string()));
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let stages = two_stage_plan(dir.path());

        let mut runner = ScriptedRunner::new();
        runner.materialize.insert(
            "extract".to_string(),
            vec![dir.path().join("metadata.jsonl")],
        );
        runner.exit_codes.insert("extract".to_string(), 7);
        let runner = Arc::new(runner);

        let result = StageRunner::new(runner.clone()).run(&stages).await;

        match result {
            Err(PipelineError::StageFailed { stage, code, stderr_tail }) => {
                assert_eq!(stage, "metadata-extract");
                assert_eq!(code, 7);
                assert!(stderr_tail.contains("simulated failure"));
            }
            other => panic!("expected StageFailed, got {other:?}"),
        }
        // The second stage never ran.
        assert_eq!(runner.invoked_programs(), vec!["extract"]);
    }

    #[tokio::test]
    async fn test_missing_declared_output_fails_before_next_stage() {
        let dir = tempfile::tempdir().unwrap();
        let stages = two_stage_plan(dir.path());

        // extract exits 0 but never writes its artifact
        let runner = Arc::new(ScriptedRunner::new());
        let result = StageRunner::new(runner.clone()).run(&stages).await;

        match result {
            Err(PipelineError::MissingArtifact { stage, artifact, .. }) => {
                assert_eq!(stage, "metadata-extract");
                assert_eq!(artifact, "metadata");
            }
            other => panic!("expected MissingArtifact, got {other:?}"),
        }
        assert_eq!(runner.invoked_programs(), vec!["extract"]);
    }

    #[test]
    fn test_empty_input_artifact_blocks_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let stages = two_stage_plan(dir.path());

        // Present but empty: the invariant requires non-empty inputs.
        let meta_path = dir.path().join("metadata.jsonl");
        std::fs::File::create(&meta_path).unwrap();
        let mut known = HashMap::new();
        known.insert("metadata".to_string(), meta_path);

        let runner = StageRunner::new(Arc::new(ScriptedRunner::new()));
        let result = runner.check_inputs(&stages[1], &known);
        assert!(matches!(result, Err(PipelineError::MissingArtifact { .. })));
    }

    #[tokio::test]
    async fn test_unknown_artifact_reference_is_config_error() {
        let stages = vec![StageSpec {
            name: "broken".to_string(),
            program: "noop".to_string(),
            args: vec![ArgToken::artifact("never-declared")],
            consumes: vec![],
            produces: vec![],
        }];

        let runner = Arc::new(ScriptedRunner::new());
        let result = StageRunner::new(runner.clone()).run(&stages).await;

        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(runner.invoked_programs().is_empty());
    }

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_BYTES * 2));
        let tail = tail_of(&long, STDERR_TAIL_BYTES);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }
}
