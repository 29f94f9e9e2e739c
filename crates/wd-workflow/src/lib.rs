//! Durable multi-step workflow engine.
//!
//! Workflows and their steps are persisted before execution, advanced under
//! a time-bounded lease, and resumed from `current_step` after a crash.
//! Handlers are looked up by name in a [`HandlerRegistry`] and must be
//! idempotent within a single step invocation: a side effect may be
//! duplicated at most once per retry attempt.

#![forbid(unsafe_code)]

mod engine;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use chrono::{DateTime, Duration, Utc};
use wd_proto::FailurePolicy;

pub use engine::{
    DEFAULT_WORKER_COUNT, LEASE_TTL_SECS, RETRY_BASE_MS, RETRY_CAP_MS, SCAN_INTERVAL_SECS,
    WorkflowEngine, WorkflowError, lease_ttl,
};

/// One step of a workflow definition.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: String,
    pub handler: String,
    pub max_retries: u32,
    pub on_failure: FailurePolicy,
}

/// A named multi-step workflow definition. Submission persists one step
/// row per entry, in declaration order.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub name: String,
    pub steps: Vec<StepDef>,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            max_retries: 3,
            timeout: Duration::minutes(5),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn step(
        mut self,
        name: impl Into<String>,
        handler: impl Into<String>,
        max_retries: u32,
        on_failure: FailurePolicy,
    ) -> Self {
        self.steps.push(StepDef {
            name: name.into(),
            handler: handler.into(),
            max_retries,
            on_failure,
        });
        self
    }
}

/// Execution context passed to every handler invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub step_name: String,
    pub attempt: u32,
    /// Workflow-level deadline; the engine also enforces it around the call.
    pub deadline: Option<DateTime<Utc>>,
}

/// A single workflow step implementation.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext, input: Value) -> Result<Value, String>;
}

/// Process-wide handler lookup, keyed by name. Registration collisions are
/// a configuration error; the last writer wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        let mut handlers = self.handlers.write();
        if handlers.insert(name.clone(), handler).is_some() {
            warn!(handler = %name, "handler re-registered, last writer wins");
        } else {
            debug!(handler = %name, "handler registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
