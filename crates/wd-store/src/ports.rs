//! Repository traits crossing the core boundary.
//!
//! All methods take `&self`; implementations provide interior mutability.
//! `get`-style lookups return `Ok(None)` for missing rows so callers can
//! distinguish absence from storage failure; mutations on missing rows
//! return [`StoreError::NotFound`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use wd_proto::{
    Agent, AgentStatus, AlertChannel, Heartbeat, Incident, Monitor, User, Workflow,
    WorkflowStatus, WorkflowStep,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} conflict: {reason}")]
    Conflict {
        entity: &'static str,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, user: User) -> Result<(), StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn update_user(&self, user: User) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AgentRepo: Send + Sync {
    async fn create_agent(&self, agent: Agent) -> Result<(), StoreError>;
    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError>;
    async fn update_agent(&self, agent: Agent) -> Result<(), StoreError>;
    async fn delete_agent(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_agents_by_user(&self, user_id: Uuid) -> Result<Vec<Agent>, StoreError>;

    /// Update the derived session state in one call.
    async fn set_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MonitorRepo: Send + Sync {
    async fn create_monitor(&self, monitor: Monitor) -> Result<(), StoreError>;
    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>, StoreError>;
    async fn update_monitor(&self, monitor: Monitor) -> Result<(), StoreError>;
    async fn delete_monitor(&self, id: Uuid) -> Result<(), StoreError>;

    /// Monitors assigned to an agent, optionally restricted to enabled ones.
    async fn list_monitors_by_agent(
        &self,
        agent_id: Uuid,
        only_enabled: bool,
    ) -> Result<Vec<Monitor>, StoreError>;
}

/// Append + range query over the heartbeat series. The SQL/time-series
/// layout behind this is out of core scope.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn append_heartbeat(&self, hb: Heartbeat) -> Result<(), StoreError>;

    /// The most recent `limit` heartbeats for a monitor, newest first.
    async fn recent_heartbeats(
        &self,
        monitor_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Heartbeat>, StoreError>;

    /// Heartbeats in `[from, to)` for a monitor, oldest first.
    async fn heartbeat_range(
        &self,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>, StoreError>;

    /// Drop heartbeats older than `cutoff` (retention). Returns the number
    /// removed.
    async fn prune_heartbeats_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait IncidentRepo: Send + Sync {
    /// Create an incident. Fails with [`StoreError::Conflict`] when a
    /// non-resolved incident already exists for the monitor; callers racing
    /// on open treat the conflict as a no-op.
    async fn create_incident(&self, incident: Incident) -> Result<(), StoreError>;
    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError>;
    async fn update_incident(&self, incident: Incident) -> Result<(), StoreError>;

    /// The single non-resolved incident for a monitor, if any.
    async fn open_incident_for_monitor(
        &self,
        monitor_id: Uuid,
    ) -> Result<Option<Incident>, StoreError>;

    async fn list_incidents_by_monitor(
        &self,
        monitor_id: Uuid,
    ) -> Result<Vec<Incident>, StoreError>;

    async fn list_open_incidents(&self) -> Result<Vec<Incident>, StoreError>;
}

#[async_trait]
pub trait ChannelRepo: Send + Sync {
    async fn create_channel(&self, channel: AlertChannel) -> Result<(), StoreError>;
    async fn get_channel(&self, id: Uuid) -> Result<Option<AlertChannel>, StoreError>;
    async fn update_channel(&self, channel: AlertChannel) -> Result<(), StoreError>;
    async fn delete_channel(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_enabled_channels_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<AlertChannel>, StoreError>;
}

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    /// Persist a workflow and its step rows in one operation.
    async fn create_workflow(
        &self,
        workflow: Workflow,
        steps: Vec<WorkflowStep>,
    ) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Step rows ordered by `step_index`.
    async fn get_workflow_steps(&self, workflow_id: Uuid)
    -> Result<Vec<WorkflowStep>, StoreError>;

    async fn update_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;
    async fn update_workflow_step(&self, step: WorkflowStep) -> Result<(), StoreError>;

    /// Atomically claim a workflow for execution. Succeeds when the
    /// workflow is `pending` or `running` and its lease is free, expired
    /// against `ttl`, or already held by `owner`. On success the returned
    /// row has `status = running` and the lease columns set.
    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Workflow>, StoreError>;

    /// Clear the lease if `owner` still holds it.
    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), StoreError>;

    /// Workflows eligible for (re-)execution: `pending` or `running` with a
    /// free or expired lease.
    async fn list_resumable_workflows(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn list_workflows_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<Workflow>, StoreError>;
}
