//! Monitor lifecycle and heartbeat ingest.
//!
//! Owns monitor creation/validation, pushes assignments to connected agents
//! through the [`AgentPush`] port, persists incoming heartbeats, and hands
//! decisioning to the incident engine. On agent disconnect every enabled
//! monitor is marked down with a synthetic heartbeat so the incident engine
//! can react.

#![forbid(unsafe_code)]

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wd_incident::{IncidentEngine, IncidentError};
use wd_proto::{
    AgentStatus, DEFAULT_FAILURE_THRESHOLD, DEFAULT_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS, Envelope,
    Heartbeat, HeartbeatPayload, HeartbeatStatus, MAX_INTERVAL_SECS, MAX_TIMEOUT_SECS,
    MIN_INTERVAL_SECS, MIN_TIMEOUT_SECS, Monitor, MonitorStatus, MonitorType, User,
    validate_target,
};
use wd_store::{AgentRepo, HeartbeatStore, MonitorRepo, StoreError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("plan limit reached: at most {limit} monitors")]
    PlanLimit { limit: u32 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("access denied for {entity} {id}")]
    Forbidden { entity: &'static str, id: Uuid },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("incident engine error: {0}")]
    Incident(#[from] IncidentError),
}

/// Push port into the hub session layer. Implemented by the hub; set after
/// construction so the service/hub dependency stays one-directional.
pub trait AgentPush: Send + Sync {
    /// Non-blocking enqueue toward a connected agent. Returns `true` iff
    /// the frame was queued.
    fn push(&self, agent_id: Uuid, frame: Envelope) -> bool;

    fn is_connected(&self, agent_id: Uuid) -> bool;
}

/// Fields accepted when creating a monitor. Missing cadence fields take
/// the documented defaults; out-of-range values are clamped.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub name: String,
    pub kind: MonitorType,
    pub target: String,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub failure_threshold: Option<u32>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MonitorUpdate {
    pub name: Option<String>,
    pub target: Option<String>,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub enabled: Option<bool>,
}

pub struct MonitorService {
    monitors: Arc<dyn MonitorRepo>,
    agents: Arc<dyn AgentRepo>,
    heartbeats: Arc<dyn HeartbeatStore>,
    incidents: Arc<IncidentEngine>,
    push: RwLock<Option<Arc<dyn AgentPush>>>,
}

impl MonitorService {
    pub fn new(
        monitors: Arc<dyn MonitorRepo>,
        agents: Arc<dyn AgentRepo>,
        heartbeats: Arc<dyn HeartbeatStore>,
        incidents: Arc<IncidentEngine>,
    ) -> Self {
        Self {
            monitors,
            agents,
            heartbeats,
            incidents,
            push: RwLock::new(None),
        }
    }

    /// Wire the hub push port. Called once during startup.
    pub fn set_push(&self, push: Arc<dyn AgentPush>) {
        *self.push.write() = Some(push);
    }

    fn push_frame(&self, agent_id: Uuid, frame: Envelope) {
        let push = self.push.read().clone();
        let Some(push) = push else { return };
        if push.is_connected(agent_id) && !push.push(agent_id, frame) {
            warn!(agent = %agent_id, "assignment push dropped: agent queue full");
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    pub async fn create_monitor(
        &self,
        user: &User,
        agent_id: Uuid,
        spec: NewMonitor,
    ) -> Result<Monitor, MonitorError> {
        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or(MonitorError::NotFound {
                entity: "agent",
                id: agent_id,
            })?;
        if agent.user_id != user.id {
            return Err(MonitorError::Forbidden {
                entity: "agent",
                id: agent_id,
            });
        }

        let name = spec.name.trim();
        if name.is_empty() || name.len() > 255 {
            return Err(MonitorError::Validation(
                "name must be 1-255 characters".to_string(),
            ));
        }
        validate_target(spec.kind, &spec.target).map_err(MonitorError::Validation)?;

        let interval = spec
            .interval_seconds
            .unwrap_or(DEFAULT_INTERVAL_SECS)
            .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        let timeout = spec
            .timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        if timeout >= interval {
            return Err(MonitorError::Validation(format!(
                "timeout {timeout}s must be shorter than interval {interval}s"
            )));
        }

        let limit = user.plan.limits().max_monitors;
        if self.count_monitors_for_user(user.id).await? >= limit {
            return Err(MonitorError::PlanLimit { limit });
        }

        let monitor = Monitor {
            id: Uuid::new_v4(),
            agent_id,
            tenant_id: user.tenant_id.clone(),
            name: name.to_string(),
            kind: spec.kind,
            target: spec.target,
            interval_seconds: interval,
            timeout_seconds: timeout,
            failure_threshold: spec.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD).max(1),
            status: MonitorStatus::Pending,
            enabled: true,
            created_at: Utc::now(),
        };
        self.monitors.create_monitor(monitor.clone()).await?;
        info!(monitor = %monitor.id, agent = %agent_id, kind = %monitor.kind, "monitor created");

        if let Ok(frame) = Envelope::monitor_assign(&monitor) {
            self.push_frame(agent_id, frame);
        }
        Ok(monitor)
    }

    pub async fn update_monitor(
        &self,
        user: &User,
        monitor_id: Uuid,
        update: MonitorUpdate,
    ) -> Result<Monitor, MonitorError> {
        let mut monitor = self.owned_monitor(user, monitor_id).await?;

        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() || name.len() > 255 {
                return Err(MonitorError::Validation(
                    "name must be 1-255 characters".to_string(),
                ));
            }
            monitor.name = name;
        }
        if let Some(target) = update.target {
            validate_target(monitor.kind, &target).map_err(MonitorError::Validation)?;
            monitor.target = target;
        }
        if let Some(interval) = update.interval_seconds {
            monitor.interval_seconds = interval.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        }
        if let Some(timeout) = update.timeout_seconds {
            monitor.timeout_seconds = timeout.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        }
        if monitor.timeout_seconds >= monitor.interval_seconds {
            return Err(MonitorError::Validation(format!(
                "timeout {}s must be shorter than interval {}s",
                monitor.timeout_seconds, monitor.interval_seconds
            )));
        }
        if let Some(threshold) = update.failure_threshold {
            monitor.failure_threshold = threshold.max(1);
        }
        if let Some(enabled) = update.enabled {
            monitor.enabled = enabled;
        }

        self.monitors.update_monitor(monitor.clone()).await?;
        if monitor.enabled {
            if let Ok(frame) = Envelope::monitor_assign(&monitor) {
                self.push_frame(monitor.agent_id, frame);
            }
        } else {
            self.push_frame(monitor.agent_id, Envelope::monitor_remove(monitor.id));
        }
        Ok(monitor)
    }

    pub async fn delete_monitor(&self, user: &User, monitor_id: Uuid) -> Result<(), MonitorError> {
        let monitor = self.owned_monitor(user, monitor_id).await?;
        self.monitors.delete_monitor(monitor_id).await?;
        info!(monitor = %monitor_id, "monitor deleted");
        self.push_frame(monitor.agent_id, Envelope::monitor_remove(monitor_id));
        Ok(())
    }

    pub async fn get_monitors_by_agent(
        &self,
        agent_id: Uuid,
        only_enabled: bool,
    ) -> Result<Vec<Monitor>, MonitorError> {
        Ok(self
            .monitors
            .list_monitors_by_agent(agent_id, only_enabled)
            .await?)
    }

    async fn owned_monitor(&self, user: &User, monitor_id: Uuid) -> Result<Monitor, MonitorError> {
        let monitor =
            self.monitors
                .get_monitor(monitor_id)
                .await?
                .ok_or(MonitorError::NotFound {
                    entity: "monitor",
                    id: monitor_id,
                })?;
        let agent =
            self.agents
                .get_agent(monitor.agent_id)
                .await?
                .ok_or(MonitorError::NotFound {
                    entity: "agent",
                    id: monitor.agent_id,
                })?;
        if agent.user_id != user.id {
            return Err(MonitorError::Forbidden {
                entity: "monitor",
                id: monitor_id,
            });
        }
        Ok(monitor)
    }

    async fn count_monitors_for_user(&self, user_id: Uuid) -> Result<u32, MonitorError> {
        let mut count = 0u32;
        for agent in self.agents.list_agents_by_user(user_id).await? {
            count += self
                .monitors
                .list_monitors_by_agent(agent.id, false)
                .await?
                .len() as u32;
        }
        Ok(count)
    }

    // ─── Ingest ──────────────────────────────────────────────────────────────

    /// Persist a heartbeat reported by `agent_id`, then evaluate it.
    /// Heartbeats for monitors not assigned to the reporting agent are
    /// rejected.
    pub async fn process_heartbeat(
        &self,
        agent_id: Uuid,
        payload: HeartbeatPayload,
    ) -> Result<(), MonitorError> {
        let monitor = self
            .monitors
            .get_monitor(payload.monitor_id)
            .await?
            .ok_or(MonitorError::NotFound {
                entity: "monitor",
                id: payload.monitor_id,
            })?;
        if monitor.agent_id != agent_id {
            warn!(
                monitor = %payload.monitor_id,
                agent = %agent_id,
                "heartbeat for monitor owned by a different agent"
            );
            return Err(MonitorError::Forbidden {
                entity: "monitor",
                id: payload.monitor_id,
            });
        }

        let hb = Heartbeat {
            time: Utc::now(),
            monitor_id: payload.monitor_id,
            agent_id,
            status: payload.status,
            latency_ms: payload.latency_ms,
            error_message: payload.error_message,
        };
        self.heartbeats.append_heartbeat(hb.clone()).await?;
        self.incidents.evaluate(&hb).await?;
        Ok(())
    }

    // ─── Session hooks ───────────────────────────────────────────────────────

    /// Called by the hub when an agent session registers. Returns the
    /// enabled monitor set for the initial `monitor.assign` push.
    pub async fn agent_connected(&self, agent_id: Uuid) -> Result<Vec<Monitor>, MonitorError> {
        self.agents
            .set_agent_status(agent_id, AgentStatus::Online, Some(Utc::now()))
            .await?;
        debug!(agent = %agent_id, "agent online");
        Ok(self
            .monitors
            .list_monitors_by_agent(agent_id, true)
            .await?)
    }

    /// Called by the hub when an agent session unregisters.
    pub async fn agent_disconnected(&self, agent_id: Uuid) -> Result<(), MonitorError> {
        self.agents
            .set_agent_status(agent_id, AgentStatus::Offline, Some(Utc::now()))
            .await?;
        info!(agent = %agent_id, "agent offline");
        self.mark_agent_monitors_down(agent_id).await
    }

    /// Mark every enabled monitor for a disconnected agent `down` and
    /// append a synthetic failure heartbeat for each so the incident engine
    /// can react.
    pub async fn mark_agent_monitors_down(&self, agent_id: Uuid) -> Result<(), MonitorError> {
        let monitors = self.monitors.list_monitors_by_agent(agent_id, true).await?;
        for mut monitor in monitors {
            if monitor.status != MonitorStatus::Down {
                monitor.status = MonitorStatus::Down;
                self.monitors.update_monitor(monitor.clone()).await?;
            }

            let hb = Heartbeat {
                time: Utc::now(),
                monitor_id: monitor.id,
                agent_id,
                status: HeartbeatStatus::Down,
                latency_ms: None,
                error_message: Some("agent disconnected".to_string()),
            };
            self.heartbeats.append_heartbeat(hb.clone()).await?;
            self.incidents.evaluate(&hb).await?;
        }
        Ok(())
    }
}
