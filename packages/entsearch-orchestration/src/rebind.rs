use crate::error::{PipelineError, Result};
use crate::readiness::ServiceManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Key under which the serving component reads its active index.
pub const ACTIVE_INDEX_KEY: &str = "ENTSEARCH_ACTIVE_INDEX";

/// The single piece of mutable shared state in a run: which index artifact
/// the serving component is bound to. Exactly `get`/`set`, injectable so
/// tests can substitute an in-memory binding.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn active_index(&self) -> Result<Option<String>>;
    async fn set_active_index(&self, index_id: &str) -> Result<()>;
}

pub struct InMemoryBindingStore {
    binding: Mutex<Option<String>>,
}

impl InMemoryBindingStore {
    pub fn new() -> Self {
        Self {
            binding: Mutex::new(None),
        }
    }

    pub fn bound_to(index_id: &str) -> Self {
        Self {
            binding: Mutex::new(Some(index_id.to_string())),
        }
    }
}

impl Default for InMemoryBindingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BindingStore for InMemoryBindingStore {
    async fn active_index(&self) -> Result<Option<String>> {
        Ok(self.binding.lock().clone())
    }

    async fn set_active_index(&self, index_id: &str) -> Result<()> {
        *self.binding.lock() = Some(index_id.to_string());
        Ok(())
    }
}

/// `KEY=value` env file the serving container loads at startup. Writes go
/// through a temp file plus rename so a crashed write never leaves a
/// half-written binding.
pub struct EnvFileBindingStore {
    path: PathBuf,
}

impl EnvFileBindingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BindingStore for EnvFileBindingStore {
    async fn active_index(&self) -> Result<Option<String>> {
        for line in self.read_lines()? {
            if let Some(value) = line.strip_prefix(ACTIVE_INDEX_KEY).and_then(|rest| rest.strip_prefix('=')) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn set_active_index(&self, index_id: &str) -> Result<()> {
        let mut lines = self.read_lines()?;
        lines.retain(|line| !line.starts_with(&format!("{ACTIVE_INDEX_KEY}=")));
        lines.push(format!("{ACTIVE_INDEX_KEY}={index_id}"));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, lines.join("\n") + "\n")?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Repoints the serving component at a freshly built index and restarts
/// only that component. The previous index is never deleted, so a failed
/// rebind leaves the old artifact being served.
pub struct ServiceRebinder {
    store: Arc<dyn BindingStore>,
    manager: Arc<dyn ServiceManager>,
}

impl ServiceRebinder {
    pub fn new(store: Arc<dyn BindingStore>, manager: Arc<dyn ServiceManager>) -> Self {
        Self { store, manager }
    }

    /// Completion is not polled here; callers follow up with the health
    /// predicate.
    pub async fn rebind(&self, component: &str, new_index_id: &str) -> Result<()> {
        let previous = self.store.active_index().await?;
        info!(
            "rebinding '{}' from {} to '{}'",
            component,
            previous.as_deref().unwrap_or("<unbound>"),
            new_index_id
        );

        self.store.set_active_index(new_index_id).await?;

        if let Err(restart_err) = self.manager.restart(component).await {
            if let Some(previous_id) = &previous {
                if let Err(rollback_err) = self.store.set_active_index(previous_id).await {
                    warn!(
                        "could not restore previous binding '{}': {}",
                        previous_id, rollback_err
                    );
                }
            }
            return Err(PipelineError::RebindFailed {
                component: component.to_string(),
                index_id: new_index_id.to_string(),
                reason: restart_err.to_string(),
            });
        }

        Ok(())
    }
}
