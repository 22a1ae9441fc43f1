use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("required services not running: {}; start them with `{remediation}`", .missing.join(", "))]
    ServiceNotRunning {
        missing: Vec<String>,
        remediation: String,
    },

    #[error("stage '{stage}' failed with exit code {code}: {stderr_tail}")]
    StageFailed {
        stage: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("artifact '{artifact}' for stage '{stage}' is missing or empty at {path}")]
    MissingArtifact {
        stage: String,
        artifact: String,
        path: String,
    },

    #[error("'{condition}' not met after {attempts} attempts; last state: {last_state}")]
    PollTimeout {
        condition: String,
        attempts: u32,
        last_state: String,
    },

    #[error("rebind of '{component}' to '{index_id}' failed: {reason}")]
    RebindFailed {
        component: String,
        index_id: String,
        reason: String,
    },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid run state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn http<E: std::fmt::Display>(e: E) -> Self {
        Self::Http(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}
