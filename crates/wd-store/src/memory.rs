//! The bundled store: in-memory tables with JSON snapshots.
//!
//! Every mutation updates the in-memory table under its lock and rewrites
//! that table's snapshot file while still holding the lock, so snapshots
//! are always a consistent point-in-time view. Opened with no state
//! directory the store is purely in-memory (tests).

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use async_trait::async_trait;
use wd_persist::SnapshotStore;
use wd_proto::{
    Agent, AgentStatus, AlertChannel, Heartbeat, Incident, IncidentStatus, Monitor, User,
    Workflow, WorkflowStatus, WorkflowStep,
};

use crate::ports::{
    AgentRepo, ChannelRepo, HeartbeatStore, IncidentRepo, MonitorRepo, StoreError, UserRepo,
    WorkflowRepo,
};

struct Snapshots {
    users: SnapshotStore,
    agents: SnapshotStore,
    monitors: SnapshotStore,
    heartbeats: SnapshotStore,
    incidents: SnapshotStore,
    channels: SnapshotStore,
    workflows: SnapshotStore,
    workflow_steps: SnapshotStore,
}

/// In-memory store with optional JSON snapshot persistence.
pub struct MemoryStore {
    users: RwLock<HashMap<Uuid, User>>,
    agents: RwLock<HashMap<Uuid, Agent>>,
    monitors: RwLock<HashMap<Uuid, Monitor>>,
    /// Per-monitor heartbeat series, oldest first.
    heartbeats: RwLock<HashMap<Uuid, Vec<Heartbeat>>>,
    incidents: RwLock<HashMap<Uuid, Incident>>,
    channels: RwLock<HashMap<Uuid, AlertChannel>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    /// Per-workflow step rows, ordered by `step_index`.
    steps: RwLock<HashMap<Uuid, Vec<WorkflowStep>>>,
    snapshots: Option<Snapshots>,
}

impl MemoryStore {
    /// A purely in-memory store. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    /// A store that snapshots every table under `state_dir` and reloads
    /// existing snapshots on open.
    pub fn open(state_dir: &Path) -> Self {
        Self::build(Some(Snapshots {
            users: SnapshotStore::new(state_dir, "users"),
            agents: SnapshotStore::new(state_dir, "agents"),
            monitors: SnapshotStore::new(state_dir, "monitors"),
            heartbeats: SnapshotStore::new(state_dir, "heartbeats"),
            incidents: SnapshotStore::new(state_dir, "incidents"),
            channels: SnapshotStore::new(state_dir, "alert_channels"),
            workflows: SnapshotStore::new(state_dir, "workflows"),
            workflow_steps: SnapshotStore::new(state_dir, "workflow_steps"),
        }))
    }

    fn build(snapshots: Option<Snapshots>) -> Self {
        let mut store = Self {
            users: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            monitors: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            incidents: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            snapshots,
        };
        store.reload();
        store
    }

    fn reload(&mut self) {
        let Some(snaps) = &self.snapshots else {
            return;
        };

        *self.users.get_mut() = load_keyed(snaps.users.load_map::<User>());
        *self.agents.get_mut() = load_keyed(snaps.agents.load_map::<Agent>());
        *self.monitors.get_mut() = load_keyed(snaps.monitors.load_map::<Monitor>());
        *self.incidents.get_mut() = load_keyed(snaps.incidents.load_map::<Incident>());
        *self.channels.get_mut() = load_keyed(snaps.channels.load_map::<AlertChannel>());
        *self.workflows.get_mut() = load_keyed(snaps.workflows.load_map::<Workflow>());

        let mut series: HashMap<Uuid, Vec<Heartbeat>> = HashMap::new();
        for hb in snaps.heartbeats.load_list::<Heartbeat>() {
            series.entry(hb.monitor_id).or_default().push(hb);
        }
        for list in series.values_mut() {
            list.sort_by_key(|hb| hb.time);
        }
        *self.heartbeats.get_mut() = series;

        let mut steps: HashMap<Uuid, Vec<WorkflowStep>> = HashMap::new();
        for step in snaps.workflow_steps.load_list::<WorkflowStep>() {
            steps.entry(step.workflow_id).or_default().push(step);
        }
        for list in steps.values_mut() {
            list.sort_by_key(|s| s.step_index);
        }
        *self.steps.get_mut() = steps;

        debug!(
            agents = self.agents.get_mut().len(),
            monitors = self.monitors.get_mut().len(),
            workflows = self.workflows.get_mut().len(),
            "loaded store snapshots"
        );
    }

    fn snapshot_map<T: serde::Serialize + Clone>(
        store: Option<&SnapshotStore>,
        table: &str,
        map: &HashMap<Uuid, T>,
    ) {
        let Some(store) = store else { return };
        let keyed: HashMap<String, T> = map.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        if let Err(e) = store.save_map(&keyed) {
            warn!(table, error = %e, "failed to snapshot table");
        }
    }

    fn snapshot_series<T: serde::Serialize + Clone>(
        store: Option<&SnapshotStore>,
        table: &str,
        series: &HashMap<Uuid, Vec<T>>,
    ) {
        let Some(store) = store else { return };
        let flat: Vec<T> = series.values().flatten().cloned().collect();
        if let Err(e) = store.save_list(&flat) {
            warn!(table, error = %e, "failed to snapshot table");
        }
    }

    fn snap(&self) -> [Option<&SnapshotStore>; 8] {
        match &self.snapshots {
            Some(s) => [
                Some(&s.users),
                Some(&s.agents),
                Some(&s.monitors),
                Some(&s.heartbeats),
                Some(&s.incidents),
                Some(&s.channels),
                Some(&s.workflows),
                Some(&s.workflow_steps),
            ],
            None => [None; 8],
        }
    }
}

fn load_keyed<T>(map: HashMap<String, T>) -> HashMap<Uuid, T> {
    map.into_iter()
        .filter_map(|(k, v)| match Uuid::parse_str(&k) {
            Ok(id) => Some((id, v)),
            Err(_) => {
                warn!(key = %k, "skipping snapshot row with invalid id");
                None
            }
        })
        .collect()
}

// ─── UserRepo ────────────────────────────────────────────────────────────────

#[async_trait]
impl UserRepo for MemoryStore {
    async fn create_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(StoreError::conflict("user", format!("{} exists", user.id)));
        }
        users.insert(user.id, user);
        Self::snapshot_map(self.snap()[0], "users", &*users);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().get(&id).cloned())
    }

    async fn update_user(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write();
        if !users.contains_key(&user.id) {
            return Err(StoreError::not_found("user", user.id));
        }
        users.insert(user.id, user);
        Self::snapshot_map(self.snap()[0], "users", &*users);
        Ok(())
    }
}

// ─── AgentRepo ───────────────────────────────────────────────────────────────

#[async_trait]
impl AgentRepo for MemoryStore {
    async fn create_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let mut agents = self.agents.write();
        if agents.contains_key(&agent.id) {
            return Err(StoreError::conflict("agent", format!("{} exists", agent.id)));
        }
        agents.insert(agent.id, agent);
        Self::snapshot_map(self.snap()[1], "agents", &*agents);
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.read().get(&id).cloned())
    }

    async fn update_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let mut agents = self.agents.write();
        if !agents.contains_key(&agent.id) {
            return Err(StoreError::not_found("agent", agent.id));
        }
        agents.insert(agent.id, agent);
        Self::snapshot_map(self.snap()[1], "agents", &*agents);
        Ok(())
    }

    async fn delete_agent(&self, id: Uuid) -> Result<(), StoreError> {
        let mut agents = self.agents.write();
        if agents.remove(&id).is_none() {
            return Err(StoreError::not_found("agent", id));
        }
        Self::snapshot_map(self.snap()[1], "agents", &*agents);
        Ok(())
    }

    async fn list_agents_by_user(&self, user_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        let mut list: Vec<Agent> = self
            .agents
            .read()
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.created_at);
        Ok(list)
    }

    async fn set_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("agent", id))?;
        agent.status = status;
        if last_seen_at.is_some() {
            agent.last_seen_at = last_seen_at;
        }
        Self::snapshot_map(self.snap()[1], "agents", &*agents);
        Ok(())
    }
}

// ─── MonitorRepo ─────────────────────────────────────────────────────────────

#[async_trait]
impl MonitorRepo for MemoryStore {
    async fn create_monitor(&self, monitor: Monitor) -> Result<(), StoreError> {
        let mut monitors = self.monitors.write();
        if monitors.contains_key(&monitor.id) {
            return Err(StoreError::conflict(
                "monitor",
                format!("{} exists", monitor.id),
            ));
        }
        monitors.insert(monitor.id, monitor);
        Self::snapshot_map(self.snap()[2], "monitors", &*monitors);
        Ok(())
    }

    async fn get_monitor(&self, id: Uuid) -> Result<Option<Monitor>, StoreError> {
        Ok(self.monitors.read().get(&id).cloned())
    }

    async fn update_monitor(&self, monitor: Monitor) -> Result<(), StoreError> {
        let mut monitors = self.monitors.write();
        if !monitors.contains_key(&monitor.id) {
            return Err(StoreError::not_found("monitor", monitor.id));
        }
        monitors.insert(monitor.id, monitor);
        Self::snapshot_map(self.snap()[2], "monitors", &*monitors);
        Ok(())
    }

    async fn delete_monitor(&self, id: Uuid) -> Result<(), StoreError> {
        let mut monitors = self.monitors.write();
        if monitors.remove(&id).is_none() {
            return Err(StoreError::not_found("monitor", id));
        }
        Self::snapshot_map(self.snap()[2], "monitors", &*monitors);
        Ok(())
    }

    async fn list_monitors_by_agent(
        &self,
        agent_id: Uuid,
        only_enabled: bool,
    ) -> Result<Vec<Monitor>, StoreError> {
        let mut list: Vec<Monitor> = self
            .monitors
            .read()
            .values()
            .filter(|m| m.agent_id == agent_id && (!only_enabled || m.enabled))
            .cloned()
            .collect();
        list.sort_by_key(|m| m.created_at);
        Ok(list)
    }
}

// ─── HeartbeatStore ──────────────────────────────────────────────────────────

#[async_trait]
impl HeartbeatStore for MemoryStore {
    async fn append_heartbeat(&self, hb: Heartbeat) -> Result<(), StoreError> {
        let mut series = self.heartbeats.write();
        series.entry(hb.monitor_id).or_default().push(hb);
        Self::snapshot_series(self.snap()[3], "heartbeats", &*series);
        Ok(())
    }

    async fn recent_heartbeats(
        &self,
        monitor_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Heartbeat>, StoreError> {
        let series = self.heartbeats.read();
        let Some(list) = series.get(&monitor_id) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().rev().take(limit).cloned().collect())
    }

    async fn heartbeat_range(
        &self,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>, StoreError> {
        let series = self.heartbeats.read();
        let Some(list) = series.get(&monitor_id) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .filter(|hb| hb.time >= from && hb.time < to)
            .cloned()
            .collect())
    }

    async fn prune_heartbeats_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut series = self.heartbeats.write();
        let mut removed: u64 = 0;
        for list in series.values_mut() {
            let before = list.len();
            list.retain(|hb| hb.time >= cutoff);
            removed += (before - list.len()) as u64;
        }
        series.retain(|_, list| !list.is_empty());
        if removed > 0 {
            Self::snapshot_series(self.snap()[3], "heartbeats", &*series);
        }
        Ok(removed)
    }
}

// ─── IncidentRepo ────────────────────────────────────────────────────────────

#[async_trait]
impl IncidentRepo for MemoryStore {
    async fn create_incident(&self, incident: Incident) -> Result<(), StoreError> {
        let mut incidents = self.incidents.write();
        let racing_open = incidents
            .values()
            .any(|i| i.monitor_id == incident.monitor_id && !i.is_resolved());
        if racing_open {
            return Err(StoreError::conflict(
                "incident",
                format!("monitor {} already has an open incident", incident.monitor_id),
            ));
        }
        incidents.insert(incident.id, incident);
        Self::snapshot_map(self.snap()[4], "incidents", &*incidents);
        Ok(())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        Ok(self.incidents.read().get(&id).cloned())
    }

    async fn update_incident(&self, incident: Incident) -> Result<(), StoreError> {
        let mut incidents = self.incidents.write();
        if !incidents.contains_key(&incident.id) {
            return Err(StoreError::not_found("incident", incident.id));
        }
        incidents.insert(incident.id, incident);
        Self::snapshot_map(self.snap()[4], "incidents", &*incidents);
        Ok(())
    }

    async fn open_incident_for_monitor(
        &self,
        monitor_id: Uuid,
    ) -> Result<Option<Incident>, StoreError> {
        Ok(self
            .incidents
            .read()
            .values()
            .find(|i| i.monitor_id == monitor_id && !i.is_resolved())
            .cloned())
    }

    async fn list_incidents_by_monitor(
        &self,
        monitor_id: Uuid,
    ) -> Result<Vec<Incident>, StoreError> {
        let mut list: Vec<Incident> = self
            .incidents
            .read()
            .values()
            .filter(|i| i.monitor_id == monitor_id)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.started_at);
        Ok(list)
    }

    async fn list_open_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        let mut list: Vec<Incident> = self
            .incidents
            .read()
            .values()
            .filter(|i| i.status == IncidentStatus::Open)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.started_at);
        Ok(list)
    }
}

// ─── ChannelRepo ─────────────────────────────────────────────────────────────

#[async_trait]
impl ChannelRepo for MemoryStore {
    async fn create_channel(&self, channel: AlertChannel) -> Result<(), StoreError> {
        let mut channels = self.channels.write();
        if channels.contains_key(&channel.id) {
            return Err(StoreError::conflict(
                "alert_channel",
                format!("{} exists", channel.id),
            ));
        }
        channels.insert(channel.id, channel);
        Self::snapshot_map(self.snap()[5], "alert_channels", &*channels);
        Ok(())
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<AlertChannel>, StoreError> {
        Ok(self.channels.read().get(&id).cloned())
    }

    async fn update_channel(&self, channel: AlertChannel) -> Result<(), StoreError> {
        let mut channels = self.channels.write();
        if !channels.contains_key(&channel.id) {
            return Err(StoreError::not_found("alert_channel", channel.id));
        }
        channels.insert(channel.id, channel);
        Self::snapshot_map(self.snap()[5], "alert_channels", &*channels);
        Ok(())
    }

    async fn delete_channel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut channels = self.channels.write();
        if channels.remove(&id).is_none() {
            return Err(StoreError::not_found("alert_channel", id));
        }
        Self::snapshot_map(self.snap()[5], "alert_channels", &*channels);
        Ok(())
    }

    async fn list_enabled_channels_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<AlertChannel>, StoreError> {
        let mut list: Vec<AlertChannel> = self
            .channels
            .read()
            .values()
            .filter(|c| c.user_id == user_id && c.enabled)
            .cloned()
            .collect();
        list.sort_by_key(|c| c.id);
        Ok(list)
    }
}

// ─── WorkflowRepo ────────────────────────────────────────────────────────────

#[async_trait]
impl WorkflowRepo for MemoryStore {
    async fn create_workflow(
        &self,
        workflow: Workflow,
        mut step_rows: Vec<WorkflowStep>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let mut steps = self.steps.write();
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::conflict(
                "workflow",
                format!("{} exists", workflow.id),
            ));
        }
        step_rows.sort_by_key(|s| s.step_index);
        steps.insert(workflow.id, step_rows);
        workflows.insert(workflow.id, workflow);
        Self::snapshot_map(self.snap()[6], "workflows", &*workflows);
        Self::snapshot_series(self.snap()[7], "workflow_steps", &*steps);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().get(&id).cloned())
    }

    async fn get_workflow_steps(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        Ok(self
            .steps
            .read()
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if !workflows.contains_key(&workflow.id) {
            return Err(StoreError::not_found("workflow", workflow.id));
        }
        workflows.insert(workflow.id, workflow);
        Self::snapshot_map(self.snap()[6], "workflows", &*workflows);
        Ok(())
    }

    async fn update_workflow_step(&self, step: WorkflowStep) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let rows = steps
            .get_mut(&step.workflow_id)
            .ok_or_else(|| StoreError::not_found("workflow", step.workflow_id))?;
        let slot = rows
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or_else(|| StoreError::not_found("workflow_step", step.id))?;
        *slot = step;
        Self::snapshot_series(self.snap()[7], "workflow_steps", &*steps);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Workflow>, StoreError> {
        let mut workflows = self.workflows.write();
        let wf = workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("workflow", id))?;

        let claimable = matches!(
            wf.status,
            WorkflowStatus::Pending | WorkflowStatus::Running
        );
        let lease_free = match (&wf.locked_by, wf.locked_at) {
            (None, _) | (_, None) => true,
            (Some(holder), Some(at)) => holder == owner || at < now - ttl,
        };
        if !claimable || !lease_free {
            return Ok(None);
        }

        wf.status = WorkflowStatus::Running;
        wf.locked_by = Some(owner.to_string());
        wf.locked_at = Some(now);
        wf.updated_at = now;
        let claimed = wf.clone();
        Self::snapshot_map(self.snap()[6], "workflows", &*workflows);
        Ok(Some(claimed))
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let wf = workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("workflow", id))?;
        if wf.locked_by.as_deref() == Some(owner) {
            wf.locked_by = None;
            wf.locked_at = None;
            Self::snapshot_map(self.snap()[6], "workflows", &*workflows);
        }
        Ok(())
    }

    async fn list_resumable_workflows(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let workflows = self.workflows.read();
        let mut eligible: Vec<&Workflow> = workflows
            .values()
            .filter(|wf| {
                matches!(
                    wf.status,
                    WorkflowStatus::Pending | WorkflowStatus::Running
                ) && match (&wf.locked_by, wf.locked_at) {
                    (None, _) | (_, None) => true,
                    (Some(_), Some(at)) => at < now - ttl,
                }
            })
            .collect();
        eligible.sort_by_key(|wf| wf.created_at);
        Ok(eligible.iter().map(|wf| wf.id).collect())
    }

    async fn list_workflows_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<Workflow>, StoreError> {
        let mut list: Vec<Workflow> = self
            .workflows
            .read()
            .values()
            .filter(|wf| wf.status == status)
            .cloned()
            .collect();
        list.sort_by_key(|wf| wf.created_at);
        Ok(list)
    }
}
