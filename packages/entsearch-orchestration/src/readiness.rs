use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::info;

/// Seam over the container/service manager: a point-in-time running query
/// plus a targeted restart. Starting services is an operator decision and
/// stays outside this trait.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn running_services(&self) -> Result<Vec<String>>;
    async fn restart(&self, service: &str) -> Result<()>;
}

/// Compose-backed manager shelling out to `docker compose`.
pub struct ComposeManager {
    compose_file: Option<PathBuf>,
}

impl ComposeManager {
    pub fn new(compose_file: Option<PathBuf>) -> Self {
        Self { compose_file }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(file) = &self.compose_file {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    async fn compose(&self, extra: &[&str]) -> Result<std::process::Output> {
        let mut args = self.base_args();
        args.extend(extra.iter().map(|s| s.to_string()));

        let output = tokio::process::Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::config(format!(
                "docker {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl ServiceManager for ComposeManager {
    async fn running_services(&self) -> Result<Vec<String>> {
        let output = self
            .compose(&["ps", "--services", "--status", "running"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        // `up -d --force-recreate` so the recreated container picks up the
        // updated binding configuration; a plain restart would not.
        self.compose(&["up", "-d", "--force-recreate", service])
            .await?;
        Ok(())
    }
}

/// Fails fast when a required background service is absent. One
/// point-in-time query, never a wait: a missing service means the
/// operator's topology is not up, and silently starting it here would
/// mask that.
pub struct ReadinessGate {
    manager: Arc<dyn ServiceManager>,
}

impl ReadinessGate {
    pub fn new(manager: Arc<dyn ServiceManager>) -> Self {
        Self { manager }
    }

    pub async fn require_running(&self, services: &[&str]) -> Result<()> {
        let running = self.manager.running_services().await?;

        let missing: Vec<String> = services
            .iter()
            .filter(|name| !running.iter().any(|r| r == *name))
            .map(|name| name.to_string())
            .collect();

        if missing.is_empty() {
            info!("required services running: {}", services.join(", "));
            return Ok(());
        }

        Err(PipelineError::ServiceNotRunning {
            remediation: format!("docker compose up -d {}", missing.join(" ")),
            missing,
        })
    }
}
