// MNEMO Workflow - durable orchestration runtime
// Policy-driven activity execution with retries, heartbeats and
// per-document serialization

use dashmap::DashMap;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::config::WorkflowConfig;
use crate::memory::{MemoryError, MemoryResult};

pub mod activities;
pub mod workflows;

pub use activities::Activities;
pub use workflows::{StoredDocument, UpdatedDocument, Workflows};

/// Execution-scoped handle passed to every activity. Long activities
/// call `heartbeat` at their I/O boundaries so the engine can tell a
/// slow activity from a stuck one.
#[derive(Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub activity: &'static str,
    last_heartbeat: Arc<Mutex<Instant>>,
}

impl ActivityContext {
    pub fn new(workflow_id: &str, activity: &'static str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            activity,
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    fn silence(&self) -> std::time::Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }
}

/// Deterministic workflow identity from an operation name and a caller
/// request id, permitting idempotent client retries.
pub fn workflow_id(operation: &str, request_id: &str) -> String {
    format!("{operation}_{request_id}")
}

/// Deterministic entity id derived from a workflow id: re-running the
/// same workflow produces the same document id.
pub fn deterministic_id(workflow_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, workflow_id.as_bytes())
}

/// Workflow engine: bounds activity concurrency, applies retry and
/// timeout policies, watches heartbeats, serializes workflows per
/// document id, and remembers completed workflow results so replays
/// short-circuit.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    activity_slots: Arc<Semaphore>,
    document_locks: DashMap<Uuid, Arc<AsyncMutex<()>>>,
    completed: Mutex<LruCache<String, serde_json::Value>>,
}

impl WorkflowEngine {
    pub fn new(config: WorkflowConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_activities.max(1)));
        let cached = NonZeroUsize::new(config.max_cached_workflows.max(1)).unwrap();
        Self {
            config,
            activity_slots: slots,
            document_locks: DashMap::new(),
            completed: Mutex::new(LruCache::new(cached)),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Serialize workflows that share a document id as their business
    /// key. The guard is held for the workflow duration.
    pub async fn lock_document(&self, document_id: &Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .document_locks
            .entry(*document_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Run a workflow under the schedule-to-close deadline. A workflow
    /// id seen before returns the recorded result without re-executing;
    /// failures surface as `Workflow` errors annotated with the
    /// underlying kind.
    pub async fn run<T, F>(&self, workflow_id: &str, operation: &str, fut: F) -> MemoryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: std::future::Future<Output = MemoryResult<T>>,
    {
        if let Some(recorded) = self.completed.lock().unwrap().get(workflow_id) {
            debug!(workflow_id, "workflow replayed from recorded result");
            return Ok(serde_json::from_value(recorded.clone())?);
        }

        let outcome = timeout(self.config.timeout.schedule_to_close, fut).await;
        match outcome {
            Ok(Ok(value)) => {
                if let Ok(recorded) = serde_json::to_value(&value) {
                    self.completed.lock().unwrap().put(workflow_id.to_string(), recorded);
                }
                Ok(value)
            }
            Ok(Err(err)) => Err(err.into_workflow(operation)),
            Err(_) => Err(MemoryError::Workflow {
                kind: crate::memory::ErrorKind::Storage,
                message: format!(
                    "{operation}: exceeded schedule-to-close deadline of {:?}",
                    self.config.timeout.schedule_to_close
                ),
            }),
        }
    }

    /// Execute one activity attempt set: bounded by the concurrency
    /// semaphore, each attempt bounded by start-to-close, stale attempts
    /// cancelled when heartbeats stop, retryable failures retried per
    /// policy.
    pub async fn execute<T, F, Fut>(&self, ctx: &ActivityContext, mut activity: F) -> MemoryResult<T>
    where
        F: FnMut(ActivityContext) -> Fut,
        Fut: std::future::Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let _slot = self
                .activity_slots
                .acquire()
                .await
                .map_err(|_| MemoryError::Storage("activity pool closed".into()))?;

            ctx.heartbeat();
            let result = self.run_attempt(ctx, activity(ctx.clone())).await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        workflow_id = %ctx.workflow_id,
                        activity = ctx.activity,
                        attempt,
                        ?delay,
                        "activity failed, retrying: {err}"
                    );
                    attempt += 1;
                    drop(_slot);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One attempt under start-to-close and the heartbeat watchdog.
    async fn run_attempt<T, Fut>(&self, ctx: &ActivityContext, fut: Fut) -> MemoryResult<T>
    where
        Fut: std::future::Future<Output = MemoryResult<T>>,
    {
        let heartbeat_grace = self.config.timeout.heartbeat * 3;
        let watchdog = async {
            loop {
                sleep(self.config.timeout.heartbeat).await;
                if ctx.silence() > heartbeat_grace {
                    return;
                }
            }
        };

        let attempt = async {
            tokio::select! {
                result = fut => result,
                _ = watchdog => Err(MemoryError::Storage(format!(
                    "activity {} cancelled: heartbeat silence exceeded {:?}",
                    ctx.activity, heartbeat_grace
                ))),
            }
        };

        match timeout(self.config.timeout.start_to_close, attempt).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Storage(format!(
                "activity {} exceeded start-to-close deadline of {:?}",
                ctx.activity, self.config.timeout.start_to_close
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn engine() -> WorkflowEngine {
        let mut config = WorkflowConfig::default();
        config.retry.initial_interval = Duration::from_millis(1);
        config.retry.max_interval = Duration::from_millis(4);
        WorkflowEngine::new(config)
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let engine = engine();
        let ctx = ActivityContext::new("wf-1", "flaky");
        let attempts = AtomicU32::new(0);

        let result: MemoryResult<u32> = engine
            .execute(&ctx, |_ctx| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(MemoryError::Storage("transient".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let engine = engine();
        let ctx = ActivityContext::new("wf-2", "strict");
        let attempts = AtomicU32::new(0);

        let result: MemoryResult<()> = engine
            .execute(&ctx, |_ctx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(MemoryError::Validation("bad input".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_records_and_replays() {
        let engine = engine();
        let executions = AtomicU32::new(0);

        for _ in 0..2 {
            let value: u32 = engine
                .run("store_document_req-1", "store_document", async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(41)
                })
                .await
                .unwrap();
            assert_eq!(value, 41);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_wraps_errors_as_workflow() {
        let engine = engine();
        let result: MemoryResult<()> = engine
            .run("wf-3", "update_document", async {
                Err(MemoryError::NotFound("gone".into()))
            })
            .await;
        match result.unwrap_err() {
            MemoryError::Workflow { kind, .. } => {
                assert_eq!(kind, crate::memory::ErrorKind::NotFound)
            }
            other => panic!("expected workflow error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_document_lock_serializes() {
        let engine = Arc::new(engine());
        let doc = Uuid::from_u128(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = engine.lock_document(&doc).await;
        let engine2 = engine.clone();
        let order2 = order.clone();
        let waiter = tokio::spawn(async move {
            let _guard = engine2.lock_document(&doc).await;
            order2.lock().unwrap().push("second");
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().unwrap().push("first");
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_deterministic_ids() {
        let a = deterministic_id(&workflow_id("store_document", "req-9"));
        let b = deterministic_id(&workflow_id("store_document", "req-9"));
        let c = deterministic_id(&workflow_id("store_document", "req-10"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
