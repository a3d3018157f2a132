//! Executor registry: maps job types to the executor that runs them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::worker::executor::{JobExecutor, ShellExecutor, echo_executor, sleep_executor};

/// Job types of the built-in executors; dynamic registrations cannot shadow them.
const PROTECTED_JOB_TYPES: &[&str] = &["shell", "echo", "sleep"];

/// Registry of executors keyed by job type.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn JobExecutor>>>,
    /// Job types registered at startup as built-ins.
    builtin_types: RwLock<HashSet<String>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            builtin_types: RwLock::new(HashSet::new()),
        }
    }

    /// Registry preloaded with the `shell`, `echo` and `sleep` executors.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_sync("shell", Arc::new(ShellExecutor::shell()));
        registry.register_sync("echo", Arc::new(echo_executor()));
        registry.register_sync("sleep", Arc::new(sleep_executor()));
        registry
    }

    /// Register an executor. Returns false if it would shadow a built-in type.
    pub async fn register(&self, kind: impl Into<String>, executor: Arc<dyn JobExecutor>) -> bool {
        let kind = kind.into();
        if self.builtin_types.read().await.contains(&kind) {
            tracing::warn!(
                job_type = %kind,
                "Rejected executor registration: would shadow a built-in job type"
            );
            return false;
        }
        self.executors.write().await.insert(kind.clone(), executor);
        tracing::debug!("Registered executor: {}", kind);
        true
    }

    /// Register an executor without awaiting, for startup wiring. Protected
    /// job types are marked built-in.
    ///
    /// Returns false if the registry is locked by a concurrent caller; the job
    /// type would then fail at run time with `UnknownJobType`.
    pub fn register_sync(&self, kind: impl Into<String>, executor: Arc<dyn JobExecutor>) -> bool {
        let kind = kind.into();
        let Ok(mut executors) = self.executors.try_write() else {
            tracing::warn!(job_type = %kind, "Executor registry busy, registration skipped");
            return false;
        };
        executors.insert(kind.clone(), executor);

        if PROTECTED_JOB_TYPES.contains(&kind.as_str()) {
            match self.builtin_types.try_write() {
                Ok(mut builtins) => {
                    builtins.insert(kind.clone());
                }
                Err(_) => tracing::warn!(
                    job_type = %kind,
                    "Could not mark job type as built-in; it may be shadowed"
                ),
            }
        }
        tracing::debug!(job_type = %kind, "Registered executor");
        true
    }

    /// Unregister an executor.
    pub async fn unregister(&self, kind: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.write().await.remove(kind)
    }

    /// Get the executor for a job type.
    pub async fn get(&self, kind: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.read().await.get(kind).cloned()
    }

    /// Check if a job type has an executor.
    pub async fn has(&self, kind: &str) -> bool {
        self.executors.read().await.contains_key(kind)
    }

    /// List registered job types, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.read().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered executors, or `None` while a writer holds the lock.
    pub fn try_count(&self) -> Option<usize> {
        self.executors.try_read().ok().map(|e| e.len())
    }

    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
