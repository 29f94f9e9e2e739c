//! Workflow execution: lease claim, step iteration, retry/backoff, and
//! crash recovery.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wd_proto::{FailurePolicy, StepStatus, Workflow, WorkflowStatus, WorkflowStep};
use wd_store::{StoreError, WorkflowRepo};

use crate::{HandlerRegistry, StepContext, WorkflowDef};

/// Lease duration; an expired lease makes a workflow claimable again.
pub const LEASE_TTL_SECS: i64 = 60;

/// Retry backoff: `RETRY_BASE_MS * 2^(attempt-1)`, capped.
pub const RETRY_BASE_MS: u64 = 100;
pub const RETRY_CAP_MS: u64 = 10_000;

/// Fixed worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Cadence of the recovery scanner. The first scan runs at startup.
pub const SCAN_INTERVAL_SECS: u64 = 30;

const SUBMIT_QUEUE_CAPACITY: usize = 256;

pub fn lease_ttl() -> Duration {
    Duration::seconds(LEASE_TTL_SECS)
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

enum StepOutcome {
    /// Step completed or was skipped; move to the next one.
    Advanced,
    /// Failure policy says stop the workflow.
    Aborted(String),
    /// The workflow deadline passed.
    TimedOut,
}

pub struct WorkflowEngine {
    repo: Arc<dyn WorkflowRepo>,
    registry: Arc<HandlerRegistry>,
    worker_id: String,
    worker_count: usize,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Mutex<Option<mpsc::Receiver<Uuid>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(repo: Arc<dyn WorkflowRepo>, registry: Arc<HandlerRegistry>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(SUBMIT_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            repo,
            registry,
            worker_id: format!("hub-{}", Uuid::new_v4()),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // ─── Submission ──────────────────────────────────────────────────────────

    /// Persist a workflow and its step rows, then enqueue it for execution.
    /// Returns the workflow id. If the local queue is saturated the
    /// recovery scanner will pick the workflow up instead.
    pub async fn submit(
        &self,
        def: &WorkflowDef,
        tenant_id: &str,
        input: Value,
    ) -> Result<Uuid, WorkflowError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: def.name.clone(),
            status: WorkflowStatus::Pending,
            current_step: 0,
            input,
            output: None,
            error: None,
            max_retries: def.max_retries,
            retry_count: 0,
            timeout_at: Some(now + def.timeout),
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        let steps: Vec<WorkflowStep> = def
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| WorkflowStep {
                id: Uuid::new_v4(),
                workflow_id: workflow.id,
                step_index: i as u32,
                name: s.name.clone(),
                handler: s.handler.clone(),
                status: StepStatus::Pending,
                on_failure: s.on_failure,
                input: None,
                output: None,
                error: None,
                retry_count: 0,
                max_retries: s.max_retries,
                duration_ms: None,
            })
            .collect();

        let id = workflow.id;
        self.repo.create_workflow(workflow, steps).await?;
        debug!(workflow = %id, name = %def.name, "workflow submitted");

        if self.queue_tx.try_send(id).is_err() {
            debug!(workflow = %id, "submit queue full, deferring to recovery scan");
        }
        Ok(id)
    }

    /// Fetch a workflow and its steps for inspection surfaces.
    pub async fn get(
        &self,
        id: Uuid,
    ) -> Result<Option<(Workflow, Vec<WorkflowStep>)>, WorkflowError> {
        let Some(workflow) = self.repo.get_workflow(id).await? else {
            return Ok(None);
        };
        let steps = self.repo.get_workflow_steps(id).await?;
        Ok(Some((workflow, steps)))
    }

    // ─── Worker pool ─────────────────────────────────────────────────────────

    /// Spawn the worker pool and the recovery scanner. The scanner's first
    /// pass resumes workflows left over from a previous process.
    pub fn start(self: &Arc<Self>) {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            warn!("workflow engine already started");
            return;
        };
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut tasks = self.tasks.lock();

        for worker in 0..self.worker_count {
            let engine = Arc::clone(self);
            let queue_rx = Arc::clone(&queue_rx);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let id = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            id = rx.recv() => match id {
                                Some(id) => id,
                                None => return,
                            },
                        }
                    };
                    debug!(worker, workflow = %id, "worker picked up workflow");
                    engine.execute(id).await;
                }
            }));
        }

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(SCAN_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tick.tick() => {}
                }
                match engine
                    .repo
                    .list_resumable_workflows(Utc::now(), lease_ttl())
                    .await
                {
                    Ok(ids) => {
                        if !ids.is_empty() {
                            info!(count = ids.len(), "recovery scan found resumable workflows");
                        }
                        for id in ids {
                            let _ = engine.queue_tx.try_send(id);
                        }
                    }
                    Err(e) => warn!(error = %e, "recovery scan failed"),
                }
            }
        }));
    }

    /// Stop workers, giving in-flight steps `grace` to finish. Abandoned
    /// workflows keep their leases and are replayed once those expire.
    pub async fn stop(&self, grace: std::time::Duration) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("workflow worker did not stop within grace period");
            }
        }
        info!("workflow engine stopped");
    }

    // ─── Execution ───────────────────────────────────────────────────────────

    /// Claim the workflow's lease and advance it to a terminal state or the
    /// workflow deadline. A worker that loses the claim returns immediately.
    pub async fn execute(&self, id: Uuid) {
        let claimed = match self
            .repo
            .try_acquire_lease(id, &self.worker_id, lease_ttl(), Utc::now())
            .await
        {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                debug!(workflow = %id, "lease not acquired, skipping");
                return;
            }
            Err(e) => {
                warn!(workflow = %id, error = %e, "lease acquisition failed");
                return;
            }
        };

        if let Err(e) = self.run(claimed).await {
            warn!(workflow = %id, error = %e, "workflow execution error");
            let _ = self.repo.release_lease(id, &self.worker_id).await;
        }
    }

    async fn run(&self, mut workflow: Workflow) -> Result<(), WorkflowError> {
        let id = workflow.id;
        let mut steps = self.repo.get_workflow_steps(id).await?;

        loop {
            let index = workflow.current_step as usize;
            if index >= steps.len() {
                break;
            }

            // Cancellation is observed at step boundaries.
            if let Some(current) = self.repo.get_workflow(id).await?
                && current.status == WorkflowStatus::Cancelled
            {
                info!(workflow = %id, "workflow cancelled, stopping");
                self.repo.release_lease(id, &self.worker_id).await?;
                return Ok(());
            }

            if self.expired(&workflow) {
                return self.fail(workflow, "timeout").await;
            }

            if matches!(steps[index].status, StepStatus::Completed | StepStatus::Skipped) {
                workflow.current_step += 1;
                self.touch(&mut workflow).await?;
                continue;
            }

            // Step input: the previous step's output when non-empty,
            // otherwise the workflow input.
            let input = if index == 0 {
                workflow.input.clone()
            } else {
                steps[index - 1]
                    .output
                    .clone()
                    .filter(|v| !v.is_null())
                    .unwrap_or_else(|| workflow.input.clone())
            };

            match self.execute_step(&workflow, &mut steps[index], input).await? {
                StepOutcome::Advanced => {
                    workflow.current_step += 1;
                    self.touch(&mut workflow).await?;
                }
                StepOutcome::Aborted(error) => {
                    return self.fail(workflow, &error).await;
                }
                StepOutcome::TimedOut => {
                    return self.fail(workflow, "timeout").await;
                }
            }
        }

        workflow.status = WorkflowStatus::Completed;
        workflow.output = steps
            .iter()
            .rev()
            .find_map(|s| s.output.clone().filter(|v| !v.is_null()));
        workflow.updated_at = Utc::now();
        self.repo.update_workflow(workflow.clone()).await?;
        self.repo.release_lease(id, &self.worker_id).await?;
        info!(workflow = %id, name = %workflow.name, "workflow completed");
        Ok(())
    }

    async fn execute_step(
        &self,
        workflow: &Workflow,
        step: &mut WorkflowStep,
        input: Value,
    ) -> Result<StepOutcome, WorkflowError> {
        step.input = Some(input.clone());

        loop {
            if self.expired(workflow) {
                return Ok(StepOutcome::TimedOut);
            }

            step.status = StepStatus::Running;
            self.repo.update_workflow_step(step.clone()).await?;

            let Some(handler) = self.registry.get(&step.handler) else {
                let error = format!("handler_not_found: {}", step.handler);
                warn!(workflow = %workflow.id, step = %step.name, %error, "step failed");
                step.error = Some(error.clone());
                // Retrying a missing handler cannot succeed; apply the
                // policy directly.
                return match step.on_failure {
                    FailurePolicy::Skip => {
                        step.status = StepStatus::Skipped;
                        self.repo.update_workflow_step(step.clone()).await?;
                        Ok(StepOutcome::Advanced)
                    }
                    FailurePolicy::Abort | FailurePolicy::Retry => {
                        step.status = StepStatus::Failed;
                        self.repo.update_workflow_step(step.clone()).await?;
                        Ok(StepOutcome::Aborted(error))
                    }
                };
            };

            let ctx = StepContext {
                workflow_id: workflow.id,
                step_name: step.name.clone(),
                attempt: step.retry_count + 1,
                deadline: workflow.timeout_at,
            };
            let started = std::time::Instant::now();
            let result = match self.remaining(workflow) {
                Some(remaining) => {
                    match tokio::time::timeout(remaining, handler.execute(&ctx, input.clone()))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err("step deadline exceeded".to_string()),
                    }
                }
                None => handler.execute(&ctx, input.clone()).await,
            };
            step.duration_ms = Some(started.elapsed().as_millis() as u64);

            match result {
                Ok(output) => {
                    step.status = StepStatus::Completed;
                    step.output = Some(output);
                    step.error = None;
                    self.repo.update_workflow_step(step.clone()).await?;
                    debug!(
                        workflow = %workflow.id,
                        step = %step.name,
                        duration_ms = step.duration_ms.unwrap_or(0),
                        "step completed"
                    );
                    return Ok(StepOutcome::Advanced);
                }
                Err(error) => {
                    step.retry_count += 1;
                    step.error = Some(error.clone());
                    self.repo.update_workflow_step(step.clone()).await?;

                    if step.retry_count <= step.max_retries {
                        let delay = backoff_delay(step.retry_count);
                        warn!(
                            workflow = %workflow.id,
                            step = %step.name,
                            attempt = step.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    match step.on_failure {
                        FailurePolicy::Abort => {
                            step.status = StepStatus::Failed;
                            self.repo.update_workflow_step(step.clone()).await?;
                            warn!(workflow = %workflow.id, step = %step.name, %error, "step failed, aborting workflow");
                            return Ok(StepOutcome::Aborted(error));
                        }
                        FailurePolicy::Skip => {
                            step.status = StepStatus::Skipped;
                            self.repo.update_workflow_step(step.clone()).await?;
                            warn!(workflow = %workflow.id, step = %step.name, %error, "step retries exhausted, skipping");
                            return Ok(StepOutcome::Advanced);
                        }
                        FailurePolicy::Retry => {
                            // Unbounded retry, limited only by the workflow
                            // deadline checked at the top of the loop.
                            tokio::time::sleep(backoff_delay(step.retry_count)).await;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Persist progress and refresh the lease stamp.
    async fn touch(&self, workflow: &mut Workflow) -> Result<(), WorkflowError> {
        let now = Utc::now();
        workflow.locked_at = Some(now);
        workflow.updated_at = now;
        self.repo.update_workflow(workflow.clone()).await?;
        Ok(())
    }

    async fn fail(&self, mut workflow: Workflow, error: &str) -> Result<(), WorkflowError> {
        let id = workflow.id;
        workflow.status = WorkflowStatus::Failed;
        workflow.error = Some(error.to_string());
        workflow.updated_at = Utc::now();
        self.repo.update_workflow(workflow).await?;
        self.repo.release_lease(id, &self.worker_id).await?;
        warn!(workflow = %id, error, "workflow failed");
        Ok(())
    }

    fn expired(&self, workflow: &Workflow) -> bool {
        workflow
            .timeout_at
            .is_some_and(|deadline| Utc::now() > deadline)
    }

    fn remaining(&self, workflow: &Workflow) -> Option<std::time::Duration> {
        workflow
            .timeout_at
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or_default())
    }

    // ─── Admin operations ────────────────────────────────────────────────────

    /// Mark a workflow cancelled. Terminal workflows are left untouched;
    /// a running worker observes the cancellation at its next step boundary.
    pub async fn cancel(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        let mut workflow = self
            .repo
            .get_workflow(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }
        workflow.status = WorkflowStatus::Cancelled;
        workflow.updated_at = Utc::now();
        self.repo.update_workflow(workflow.clone()).await?;
        info!(workflow = %id, "workflow cancelled");
        Ok(workflow)
    }

    /// Re-run a failed workflow: clears the error and lease, resets failed
    /// steps, pushes the deadline forward by the original allowance, and
    /// re-enqueues. Only `failed` workflows may be retried.
    pub async fn retry(&self, id: Uuid) -> Result<(), WorkflowError> {
        let mut workflow = self
            .repo
            .get_workflow(id)
            .await?
            .ok_or(WorkflowError::NotFound(id))?;
        if workflow.status != WorkflowStatus::Failed {
            return Err(WorkflowError::InvalidState(format!(
                "workflow {id} is {:?}, only failed workflows can be retried",
                workflow.status
            )));
        }

        let allowance = workflow
            .timeout_at
            .map(|deadline| deadline - workflow.created_at);
        let now = Utc::now();
        workflow.status = WorkflowStatus::Pending;
        workflow.retry_count = 0;
        workflow.error = None;
        workflow.locked_by = None;
        workflow.locked_at = None;
        workflow.timeout_at = allowance.map(|a| now + a);
        workflow.updated_at = now;
        self.repo.update_workflow(workflow).await?;

        for mut step in self.repo.get_workflow_steps(id).await? {
            if step.status == StepStatus::Failed || step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                step.retry_count = 0;
                step.error = None;
                self.repo.update_workflow_step(step).await?;
            }
        }

        info!(workflow = %id, "workflow queued for retry");
        let _ = self.queue_tx.try_send(id);
        Ok(())
    }
}

fn backoff_delay(attempt: u32) -> std::time::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = RETRY_BASE_MS.saturating_mul(1u64 << exp).min(RETRY_CAP_MS);
    std::time::Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StepHandler, WorkflowDef};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wd_store::MemoryStore;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, String> {
            Ok(input)
        }
    }

    struct Counting {
        calls: AtomicU32,
        output: Value,
    }

    impl Counting {
        fn new(output: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                output,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl StepHandler for Counting {
        async fn execute(&self, _ctx: &StepContext, _input: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.output.clone())
        }
    }

    struct FailFirst {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for FailFirst {
        async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, String> {
            if self
                .failures_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                Err("transient".to_string())
            } else {
                Ok(input)
            }
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl StepHandler for AlwaysFail {
        async fn execute(&self, _ctx: &StepContext, _input: Value) -> Result<Value, String> {
            Err("permanent".to_string())
        }
    }

    struct Slow;

    #[async_trait]
    impl StepHandler for Slow {
        async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, String> {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            Ok(input)
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<HandlerRegistry>, Arc<WorkflowEngine>) {
        let store = Arc::new(MemoryStore::in_memory());
        let registry = Arc::new(HandlerRegistry::new());
        let engine = WorkflowEngine::new(store.clone(), registry.clone());
        (store, registry, engine)
    }

    #[tokio::test]
    async fn test_single_step_completes_and_releases_lease() {
        let (_store, registry, engine) = setup();
        registry.register("echo", Arc::new(Echo));
        let def = WorkflowDef::new("t").step("only", "echo", 0, FailurePolicy::Abort);

        let id = engine
            .submit(&def, "t-1", json!({"k": "v"}))
            .await
            .expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.output, Some(json!({"k": "v"})));
        assert!(workflow.locked_by.is_none(), "lease must be released");
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(steps[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_step_outputs_chain_and_null_falls_back_to_input() {
        let (_store, registry, engine) = setup();
        let first = Counting::new(json!({"from": "first"}));
        let second = Counting::new(Value::Null);
        registry.register("first", first.clone());
        registry.register("second", second.clone());
        registry.register("echo", Arc::new(Echo));

        let def = WorkflowDef::new("chain")
            .step("a", "first", 0, FailurePolicy::Abort)
            .step("b", "second", 0, FailurePolicy::Abort)
            .step("c", "echo", 0, FailurePolicy::Abort);
        let id = engine
            .submit(&def, "t-1", json!({"root": true}))
            .await
            .expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(steps[1].input, Some(json!({"from": "first"})));
        // Second step produced null, so the third falls back to the
        // workflow input.
        assert_eq!(steps[2].input, Some(json!({"root": true})));
        assert_eq!(workflow.output, Some(json!({"root": true})));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (_store, registry, engine) = setup();
        registry.register(
            "flaky",
            Arc::new(FailFirst {
                failures_left: AtomicU32::new(1),
            }),
        );
        let def = WorkflowDef::new("t").step("s", "flaky", 2, FailurePolicy::Abort);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(steps[0].retry_count, 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_abort_policy_fails_workflow() {
        let (_store, registry, engine) = setup();
        registry.register("bad", Arc::new(AlwaysFail));
        registry.register("echo", Arc::new(Echo));
        let def = WorkflowDef::new("t")
            .step("s0", "bad", 1, FailurePolicy::Abort)
            .step("s1", "echo", 0, FailurePolicy::Abort);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.error.as_deref(), Some("permanent"));
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].retry_count, 2, "one attempt plus one retry");
        assert_eq!(steps[1].status, StepStatus::Pending, "later steps untouched");
    }

    #[tokio::test]
    async fn test_skip_policy_continues_workflow() {
        let (_store, registry, engine) = setup();
        registry.register("bad", Arc::new(AlwaysFail));
        let tail = Counting::new(json!("done"));
        registry.register("tail", tail.clone());
        let def = WorkflowDef::new("t")
            .step("s0", "bad", 2, FailurePolicy::Skip)
            .step("s1", "tail", 0, FailurePolicy::Skip);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert_eq!(steps[0].retry_count, 3, "initial try plus two retries");
        assert_eq!(tail.calls(), 1);
        assert_eq!(workflow.output, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_missing_handler_aborts() {
        let (_store, _registry, engine) = setup();
        let def = WorkflowDef::new("t").step("s", "nowhere", 3, FailurePolicy::Abort);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(
            workflow.error.as_deref(),
            Some("handler_not_found: nowhere")
        );
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_workflow_timeout() {
        let (_store, registry, engine) = setup();
        registry.register("slow", Arc::new(Slow));
        let def = WorkflowDef::new("t")
            .timeout(Duration::milliseconds(50))
            .step("s", "slow", 0, FailurePolicy::Retry);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.execute(id).await;

        let (workflow, _) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_cancel_prevents_execution() {
        let (_store, registry, engine) = setup();
        let handler = Counting::new(json!(1));
        registry.register("count", handler.clone());
        let def = WorkflowDef::new("t").step("s", "count", 0, FailurePolicy::Abort);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        engine.cancel(id).await.expect("cancel");
        engine.execute(id).await;

        let (workflow, _) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Cancelled);
        assert_eq!(handler.calls(), 0, "cancelled workflow must not run");
    }

    #[tokio::test]
    async fn test_crash_recovery_replays_only_incomplete_steps() {
        let (store, registry, engine) = setup();
        let h0 = Counting::new(json!("zero"));
        let h1 = Counting::new(json!("one"));
        let h2 = Counting::new(json!("two"));
        registry.register("h0", h0.clone());
        registry.register("h1", h1.clone());
        registry.register("h2", h2.clone());

        let def = WorkflowDef::new("t")
            .step("s0", "h0", 0, FailurePolicy::Abort)
            .step("s1", "h1", 0, FailurePolicy::Abort)
            .step("s2", "h2", 0, FailurePolicy::Abort);
        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");

        // Simulate a crash after step 0 persisted: completed step row,
        // advanced cursor, and a stale lease held by a dead worker.
        let mut workflow = store.get_workflow(id).await.expect("get").expect("exists");
        let mut steps = store.get_workflow_steps(id).await.expect("steps");
        steps[0].status = StepStatus::Completed;
        steps[0].output = Some(json!("zero"));
        store
            .update_workflow_step(steps[0].clone())
            .await
            .expect("persist step");
        workflow.status = WorkflowStatus::Running;
        workflow.current_step = 1;
        workflow.locked_by = Some("dead-worker".to_string());
        workflow.locked_at = Some(Utc::now() - Duration::seconds(LEASE_TTL_SECS + 30));
        store.update_workflow(workflow).await.expect("persist wf");

        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(h0.calls(), 0, "completed step must not re-execute");
        assert_eq!(h1.calls(), 1);
        assert_eq!(h2.calls(), 1);
        assert_eq!(steps[1].input, Some(json!("zero")), "step outputs preserved");
    }

    #[tokio::test]
    async fn test_retry_only_from_failed_and_resets_state() {
        let (_store, registry, engine) = setup();
        registry.register("bad", Arc::new(AlwaysFail));
        let def = WorkflowDef::new("t").step("s", "bad", 0, FailurePolicy::Abort);

        let id = engine.submit(&def, "t-1", json!(1)).await.expect("submit");
        assert!(
            engine.retry(id).await.is_err(),
            "pending workflow is not retryable"
        );

        engine.execute(id).await;
        let (workflow, _) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Failed);

        engine.retry(id).await.expect("retry");
        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert!(workflow.locked_by.is_none());
        assert!(workflow.error.is_none());
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert_eq!(steps[0].retry_count, 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1).as_millis(), 100);
        assert_eq!(backoff_delay(2).as_millis(), 200);
        assert_eq!(backoff_delay(3).as_millis(), 400);
        assert_eq!(backoff_delay(8).as_millis(), 10_000);
        assert_eq!(backoff_delay(30).as_millis(), 10_000);
    }
}
