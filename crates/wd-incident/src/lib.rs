//! Failure-threshold incident engine.
//!
//! Evaluates each ingested heartbeat against the N-consecutive-failure rule,
//! keeps `(incident, monitor.status)` consistent, and hands state changes to
//! the alert dispatch workflow through the narrow [`WorkflowSubmitter`] port.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::{DateTime, Utc};
use wd_proto::{Heartbeat, Incident, IncidentStatus, Monitor, MonitorStatus};
use wd_store::{HeartbeatStore, IncidentRepo, MonitorRepo, StoreError};

/// Workflow name submitted on every incident transition.
pub const ALERT_DISPATCH_WORKFLOW: &str = "alert_dispatch";

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident {0} not found")]
    NotFound(Uuid),

    #[error("invalid incident transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Input persisted as the `alert_dispatch` workflow payload. Ids only —
/// handlers re-fetch entities, and secrets never enter workflow history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDispatchInput {
    pub incident_id: Uuid,
    pub monitor_id: Uuid,
    pub agent_id: Uuid,
    pub opened: bool,
}

/// Narrow submission port into the workflow engine. Set post-construction
/// to break the service cycle at the type level.
#[async_trait]
pub trait WorkflowSubmitter: Send + Sync {
    async fn submit(&self, name: &str, input: Value) -> Result<Uuid, String>;
}

/// Counters for incident activity, readable for health/metrics surfaces.
#[derive(Debug, Default)]
pub struct IncidentMetrics {
    pub opened_total: AtomicU64,
    pub resolved_total: AtomicU64,
    pub dispatch_submitted: AtomicU64,
    pub dispatch_failed: AtomicU64,
}

pub struct IncidentEngine {
    monitors: Arc<dyn MonitorRepo>,
    incidents: Arc<dyn IncidentRepo>,
    heartbeats: Arc<dyn HeartbeatStore>,
    submitter: RwLock<Option<Arc<dyn WorkflowSubmitter>>>,
    /// Linearizes `(incident, monitor.status)` updates. The bundled store
    /// is in-process; a SQL deployment would rely on a serializable
    /// transaction here instead.
    gate: Mutex<()>,
    pub metrics: IncidentMetrics,
}

impl IncidentEngine {
    pub fn new(
        monitors: Arc<dyn MonitorRepo>,
        incidents: Arc<dyn IncidentRepo>,
        heartbeats: Arc<dyn HeartbeatStore>,
    ) -> Self {
        Self {
            monitors,
            incidents,
            heartbeats,
            submitter: RwLock::new(None),
            gate: Mutex::new(()),
            metrics: IncidentMetrics::default(),
        }
    }

    /// Wire the dispatch port. Called once during startup, after the
    /// workflow engine exists.
    pub fn set_submitter(&self, submitter: Arc<dyn WorkflowSubmitter>) {
        *self.submitter.write() = Some(submitter);
    }

    /// Evaluate one persisted heartbeat. The heartbeat must already be in
    /// the store: the strike window is computed from the persisted tail, so
    /// a crashed-then-retried evaluation reaches the same conclusion.
    pub async fn evaluate(&self, hb: &Heartbeat) -> Result<(), IncidentError> {
        let event = {
            let _gate = self.gate.lock().await;

            let Some(monitor) = self.monitors.get_monitor(hb.monitor_id).await? else {
                debug!(monitor = %hb.monitor_id, "heartbeat for unknown monitor, ignoring");
                return Ok(());
            };
            if !monitor.enabled {
                return Ok(());
            }

            if hb.status.is_failure() {
                self.evaluate_failure(monitor, hb).await?
            } else {
                self.evaluate_recovery(monitor, hb).await?
            }
        };

        // Dispatch happens outside the gate: the incident is durable either
        // way and alerts are best-effort until the next state change.
        if let Some((incident, monitor, opened)) = event {
            self.dispatch(&incident, &monitor, opened).await;
        }
        Ok(())
    }

    async fn evaluate_recovery(
        &self,
        mut monitor: Monitor,
        hb: &Heartbeat,
    ) -> Result<Option<(Incident, Monitor, bool)>, IncidentError> {
        if monitor.status != MonitorStatus::Up {
            monitor.status = MonitorStatus::Up;
            self.monitors.update_monitor(monitor.clone()).await?;
        }

        let Some(mut open) = self
            .incidents
            .open_incident_for_monitor(monitor.id)
            .await?
        else {
            return Ok(None);
        };

        open.status = IncidentStatus::Resolved;
        open.resolved_at = Some(hb.time);
        open.ttr_seconds = Some((hb.time - open.started_at).num_seconds());
        self.incidents.update_incident(open.clone()).await?;
        self.metrics.resolved_total.fetch_add(1, Ordering::Relaxed);
        info!(
            incident = %open.id,
            monitor = %monitor.id,
            ttr_seconds = open.ttr_seconds.unwrap_or(0),
            "incident resolved"
        );
        Ok(Some((open, monitor, false)))
    }

    async fn evaluate_failure(
        &self,
        mut monitor: Monitor,
        hb: &Heartbeat,
    ) -> Result<Option<(Incident, Monitor, bool)>, IncidentError> {
        let n = monitor.failure_threshold.max(1) as usize;
        let window = self.heartbeats.recent_heartbeats(monitor.id, n).await?;
        let strikes = window.iter().filter(|h| h.status.is_failure()).count();

        if window.len() < n || strikes < n {
            // Below threshold: first misses leave the status as-is.
            return Ok(None);
        }

        if self
            .incidents
            .open_incident_for_monitor(monitor.id)
            .await?
            .is_some()
        {
            // Already open; nothing new to record.
            return Ok(None);
        }

        // The window is newest-first; the incident starts at the earliest
        // failure of the run.
        let started_at = window.last().map(|h| h.time).unwrap_or(hb.time);
        let incident = Incident {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            status: IncidentStatus::Open,
            started_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            ttr_seconds: None,
        };

        match self.incidents.create_incident(incident.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                // Lost the open race; the winning incident is authoritative.
                debug!(monitor = %monitor.id, "incident open race lost, treating as no-op");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        monitor.status = MonitorStatus::Down;
        self.monitors.update_monitor(monitor.clone()).await?;
        self.metrics.opened_total.fetch_add(1, Ordering::Relaxed);
        info!(
            incident = %incident.id,
            monitor = %monitor.id,
            started_at = %incident.started_at,
            threshold = n,
            "incident opened"
        );
        Ok(Some((incident, monitor, true)))
    }

    async fn dispatch(&self, incident: &Incident, monitor: &Monitor, opened: bool) {
        let submitter = self.submitter.read().clone();
        let Some(submitter) = submitter else {
            debug!(incident = %incident.id, "no workflow submitter wired, skipping dispatch");
            return;
        };

        let input = AlertDispatchInput {
            incident_id: incident.id,
            monitor_id: monitor.id,
            agent_id: monitor.agent_id,
            opened,
        };
        let payload = match serde_json::to_value(&input) {
            Ok(v) => v,
            Err(e) => {
                warn!(incident = %incident.id, error = %e, "failed to encode dispatch input");
                return;
            }
        };

        match submitter.submit(ALERT_DISPATCH_WORKFLOW, payload).await {
            Ok(workflow_id) => {
                self.metrics
                    .dispatch_submitted
                    .fetch_add(1, Ordering::Relaxed);
                debug!(incident = %incident.id, workflow = %workflow_id, "alert dispatch submitted");
            }
            Err(e) => {
                // The incident is already durable; alerts stay best-effort
                // until the next state change.
                self.metrics.dispatch_failed.fetch_add(1, Ordering::Relaxed);
                warn!(incident = %incident.id, error = %e, "alert dispatch submission failed");
            }
        }
    }

    /// Manual `open → acknowledged` transition. Idempotent.
    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<Incident, IncidentError> {
        let _gate = self.gate.lock().await;
        let mut incident = self
            .incidents
            .get_incident(id)
            .await?
            .ok_or(IncidentError::NotFound(id))?;

        match incident.status {
            IncidentStatus::Acknowledged => Ok(incident),
            IncidentStatus::Resolved => Err(IncidentError::InvalidTransition(format!(
                "incident {id} is already resolved"
            ))),
            IncidentStatus::Open => {
                incident.status = IncidentStatus::Acknowledged;
                incident.acknowledged_at = Some(Utc::now());
                incident.acknowledged_by = Some(by.to_string());
                self.incidents.update_incident(incident.clone()).await?;
                info!(incident = %id, by, "incident acknowledged");
                Ok(incident)
            }
        }
    }

    /// Manual `{open, acknowledged} → resolved` transition. Idempotent.
    pub async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> Result<Incident, IncidentError> {
        let _gate = self.gate.lock().await;
        let mut incident = self
            .incidents
            .get_incident(id)
            .await?
            .ok_or(IncidentError::NotFound(id))?;

        if incident.status == IncidentStatus::Resolved {
            return Ok(incident);
        }

        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(at);
        incident.ttr_seconds = Some((at - incident.started_at).num_seconds());
        self.incidents.update_incident(incident.clone()).await?;
        self.metrics.resolved_total.fetch_add(1, Ordering::Relaxed);
        info!(incident = %id, "incident resolved manually");
        Ok(incident)
    }
}
