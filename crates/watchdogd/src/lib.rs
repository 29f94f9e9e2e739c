//! Hub daemon wiring: builds the store, engines, hub, and lifecycle
//! registry from a [`config::HubConfig`].

#![forbid(unsafe_code)]

pub mod config;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wd_auth::AgentAuth;
use wd_crypto::SecretBox;
use wd_dispatch::{DispatchDeps, DispatchSubmitter, alert_dispatch_def, register_handlers};
use wd_hub::Hub;
use wd_incident::IncidentEngine;
use wd_monitor::MonitorService;
use wd_notify::{Notifier, NotifierFactory};
use wd_registry::{Module, Registry};
use wd_store::{HeartbeatStore, MemoryStore};
use wd_workflow::{HandlerRegistry, WorkflowEngine};

use config::HubConfig;

/// In-flight workflow steps get this long to finish on shutdown; leases of
/// abandoned steps expire and a future worker replays them.
pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

const RETENTION_SWEEP_SECS: u64 = 3600;

/// Everything a running hub daemon consists of.
pub struct Runtime {
    pub registry: Registry,
    pub hub: Arc<Hub>,
    pub engine: Arc<WorkflowEngine>,
    pub monitors: Arc<MonitorService>,
    pub incidents: Arc<IncidentEngine>,
}

/// Wire every component from configuration. Ports are connected here and
/// nowhere else: the hub is handed to the monitor service as its push port,
/// and the workflow engine is handed to the incident engine as its
/// submitter.
pub fn build(config: &HubConfig) -> anyhow::Result<Runtime> {
    let store = Arc::new(MemoryStore::open(&config.state_dir));
    let secrets = SecretBox::new(&config.encryption_key)?;

    let incidents = Arc::new(IncidentEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let monitors = Arc::new(MonitorService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        incidents.clone(),
    ));
    let auth = Arc::new(AgentAuth::new(store.clone(), secrets.clone()));
    let hub = Hub::new(auth, monitors.clone());
    monitors.set_push(hub.clone());

    let handlers = Arc::new(HandlerRegistry::new());
    let factory = Arc::new(NotifierFactory::new(secrets));
    let global = wd_notify::global_from_env()?;
    let include_global = global.is_some();
    register_handlers(
        &handlers,
        DispatchDeps {
            incidents: store.clone(),
            monitors: store.clone(),
            agents: store.clone(),
            channels: store.clone(),
            factory,
        },
        global.map(|g| Arc::new(g) as Arc<dyn Notifier>),
    );

    let engine = WorkflowEngine::new(store.clone(), handlers);
    incidents.set_submitter(Arc::new(DispatchSubmitter::new(
        engine.clone(),
        alert_dispatch_def(include_global),
        store.clone(),
    )));

    let mut registry = Registry::new();
    registry.register(Arc::new(StoreModule {
        store: store.clone(),
        retention_days: config.retention_days,
        sweeper: Mutex::new(None),
    }));
    registry.register(Arc::new(WorkflowModule {
        engine: engine.clone(),
    }));
    registry.register(Arc::new(HubModule {
        hub: hub.clone(),
        listen_addr: config.listen_addr,
    }));

    Ok(Runtime {
        registry,
        hub,
        engine,
        monitors,
        incidents,
    })
}

// ─── Modules ─────────────────────────────────────────────────────────────────

struct StoreModule {
    store: Arc<MemoryStore>,
    retention_days: i64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Module for StoreModule {
    fn name(&self) -> &str {
        "store"
    }

    async fn init(&self) -> Result<(), String> {
        let store = Arc::clone(&self.store);
        let retention_days = self.retention_days;
        let handle = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(RETENTION_SWEEP_SECS));
            loop {
                tick.tick().await;
                let cutoff = Utc::now() - Duration::days(retention_days);
                match store.prune_heartbeats_before(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned heartbeats past retention"),
                    Err(e) => warn!(error = %e, "heartbeat retention sweep failed"),
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn health(&self) -> Result<(), String> {
        Ok(())
    }
}

struct WorkflowModule {
    engine: Arc<WorkflowEngine>,
}

#[async_trait]
impl Module for WorkflowModule {
    fn name(&self) -> &str {
        "workflow"
    }

    async fn init(&self) -> Result<(), String> {
        self.engine.start();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.engine.stop(SHUTDOWN_GRACE).await;
        Ok(())
    }

    fn health(&self) -> Result<(), String> {
        Ok(())
    }
}

struct HubModule {
    hub: Arc<Hub>,
    listen_addr: SocketAddr,
}

#[async_trait]
impl Module for HubModule {
    fn name(&self) -> &str {
        "hub"
    }

    async fn init(&self) -> Result<(), String> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| format!("bind {}: {e}", self.listen_addr))?;
        tokio::spawn(Arc::clone(&self.hub).serve(listener));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.hub.begin_shutdown();
        Ok(())
    }

    fn health(&self) -> Result<(), String> {
        Ok(())
    }
}
