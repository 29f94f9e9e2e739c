//! The `alert_dispatch` workflow.
//!
//! Step sequence: `resolve_channels` (abort on failure), one `send_<type>`
//! step per channel type (skip on failure), an optional `send_global` step
//! for environment-level notifiers, and `record_dispatch`. The payload
//! carries channel ids only; send steps re-fetch each channel so decrypted
//! secrets never land in workflow history.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use wd_incident::{ALERT_DISPATCH_WORKFLOW, AlertDispatchInput, WorkflowSubmitter};
use wd_notify::{Notifier, NotifierFactory};
use wd_proto::{AlertChannel, ChannelType, FailurePolicy, Incident, Monitor};
use wd_store::{AgentRepo, ChannelRepo, IncidentRepo, MonitorRepo};
use wd_workflow::{HandlerRegistry, StepContext, StepHandler, WorkflowDef, WorkflowEngine};

/// Reference to a channel by id and type; the send steps re-fetch the full
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ChannelType,
}

/// Payload produced by `resolve_channels` and passed through every
/// subsequent step unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub incident: Incident,
    pub monitor: Monitor,
    pub opened: bool,
    pub channels: Vec<ChannelRef>,
}

/// Construction-time bag of repository references shared by the handlers.
/// Handlers never call back into the services.
#[derive(Clone)]
pub struct DispatchDeps {
    pub incidents: Arc<dyn IncidentRepo>,
    pub monitors: Arc<dyn MonitorRepo>,
    pub agents: Arc<dyn AgentRepo>,
    pub channels: Arc<dyn ChannelRepo>,
    pub factory: Arc<NotifierFactory>,
}

// ─── resolve_channels ────────────────────────────────────────────────────────

pub struct ResolveChannelsHandler {
    deps: DispatchDeps,
}

#[async_trait]
impl StepHandler for ResolveChannelsHandler {
    async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, String> {
        let input: AlertDispatchInput =
            serde_json::from_value(input).map_err(|e| format!("bad dispatch input: {e}"))?;

        let incident = self
            .deps
            .incidents
            .get_incident(input.incident_id)
            .await
            .map_err(|e| format!("load incident {}: {e}", input.incident_id))?
            .ok_or_else(|| format!("incident {} not found", input.incident_id))?;
        let monitor = self
            .deps
            .monitors
            .get_monitor(input.monitor_id)
            .await
            .map_err(|e| format!("load monitor {}: {e}", input.monitor_id))?
            .ok_or_else(|| format!("monitor {} not found", input.monitor_id))?;
        let agent = self
            .deps
            .agents
            .get_agent(input.agent_id)
            .await
            .map_err(|e| format!("load agent {}: {e}", input.agent_id))?
            .ok_or_else(|| format!("agent {} not found", input.agent_id))?;

        let channels = self
            .deps
            .channels
            .list_enabled_channels_by_user(agent.user_id)
            .await
            .map_err(|e| format!("list channels for user {}: {e}", agent.user_id))?
            .iter()
            .map(|c| ChannelRef {
                id: c.id,
                kind: c.kind,
            })
            .collect::<Vec<_>>();

        info!(
            incident = %incident.id,
            monitor = %monitor.id,
            channels = channels.len(),
            opened = input.opened,
            "resolved alert channels"
        );
        let payload = DispatchPayload {
            incident,
            monitor,
            opened: input.opened,
            channels,
        };
        serde_json::to_value(&payload).map_err(|e| format!("encode payload: {e}"))
    }
}

// ─── send_<type> ─────────────────────────────────────────────────────────────

pub struct SendChannelHandler {
    kind: ChannelType,
    deps: DispatchDeps,
}

impl SendChannelHandler {
    async fn deliver(&self, channel: &AlertChannel, payload: &DispatchPayload) -> Result<(), String> {
        let notifier = self
            .deps
            .factory
            .build_from_channel(channel)
            .map_err(|e| format!("channel {}: {e}", channel.id))?;
        let result = if payload.opened {
            notifier
                .notify_incident_opened(&payload.incident, &payload.monitor)
                .await
        } else {
            notifier
                .notify_incident_resolved(&payload.incident, &payload.monitor)
                .await
        };
        result.map_err(|e| format!("channel {}: {e}", channel.id))
    }
}

#[async_trait]
impl StepHandler for SendChannelHandler {
    async fn execute(&self, ctx: &StepContext, input: Value) -> Result<Value, String> {
        let payload: DispatchPayload =
            serde_json::from_value(input.clone()).map_err(|e| format!("bad payload: {e}"))?;

        let mut attempted = 0usize;
        let mut failures: Vec<String> = Vec::new();
        for channel_ref in payload.channels.iter().filter(|c| c.kind == self.kind) {
            // Re-fetch by id: the stored record may have changed, and the
            // sealed config must never ride along in the payload.
            let channel = match self.deps.channels.get_channel(channel_ref.id).await {
                Ok(Some(c)) if c.enabled => c,
                Ok(_) => {
                    warn!(channel = %channel_ref.id, "channel vanished or disabled, skipping");
                    continue;
                }
                Err(e) => {
                    failures.push(format!("channel {}: {e}", channel_ref.id));
                    continue;
                }
            };

            attempted += 1;
            if let Err(e) = self.deliver(&channel, &payload).await {
                warn!(
                    workflow = %ctx.workflow_id,
                    kind = %self.kind,
                    error = %e,
                    "channel delivery failed"
                );
                failures.push(e);
            }
        }

        // The step fails only when every addressed channel failed;
        // partial failures are logged and skipped.
        if attempted > 0 && failures.len() >= attempted {
            return Err(failures.join("; "));
        }
        Ok(input)
    }
}

// ─── send_global ─────────────────────────────────────────────────────────────

pub struct SendGlobalHandler {
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl StepHandler for SendGlobalHandler {
    async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, String> {
        let payload: DispatchPayload =
            serde_json::from_value(input.clone()).map_err(|e| format!("bad payload: {e}"))?;
        let result = if payload.opened {
            self.notifier
                .notify_incident_opened(&payload.incident, &payload.monitor)
                .await
        } else {
            self.notifier
                .notify_incident_resolved(&payload.incident, &payload.monitor)
                .await
        };
        result.map_err(|e| e.to_string())?;
        Ok(input)
    }
}

// ─── record_dispatch ─────────────────────────────────────────────────────────

pub struct RecordDispatchHandler;

#[async_trait]
impl StepHandler for RecordDispatchHandler {
    async fn execute(&self, ctx: &StepContext, input: Value) -> Result<Value, String> {
        let payload: DispatchPayload =
            serde_json::from_value(input.clone()).map_err(|e| format!("bad payload: {e}"))?;
        info!(
            workflow = %ctx.workflow_id,
            incident = %payload.incident.id,
            monitor = %payload.monitor.id,
            channels = payload.channels.len(),
            opened = payload.opened,
            "alert dispatch recorded"
        );
        Ok(input)
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

fn send_handler_name(kind: ChannelType) -> String {
    format!("send_{kind}")
}

/// The `alert_dispatch` workflow definition. Every channel type gets a send
/// step; types with no resolved channels complete trivially.
pub fn alert_dispatch_def(include_global: bool) -> WorkflowDef {
    let mut def = WorkflowDef::new(ALERT_DISPATCH_WORKFLOW).step(
        "resolve_channels",
        "resolve_channels",
        1,
        FailurePolicy::Abort,
    );
    for kind in ChannelType::ALL {
        def = def.step(send_handler_name(kind), send_handler_name(kind), 2, FailurePolicy::Skip);
    }
    if include_global {
        def = def.step("send_global", "send_global", 2, FailurePolicy::Skip);
    }
    def.step("record_dispatch", "record_dispatch", 0, FailurePolicy::Skip)
}

/// Register every dispatch handler into the engine's registry.
pub fn register_handlers(
    registry: &HandlerRegistry,
    deps: DispatchDeps,
    global_notifier: Option<Arc<dyn Notifier>>,
) {
    registry.register(
        "resolve_channels",
        Arc::new(ResolveChannelsHandler { deps: deps.clone() }),
    );
    for kind in ChannelType::ALL {
        registry.register(
            send_handler_name(kind),
            Arc::new(SendChannelHandler {
                kind,
                deps: deps.clone(),
            }),
        );
    }
    if let Some(notifier) = global_notifier {
        registry.register("send_global", Arc::new(SendGlobalHandler { notifier }));
    }
    registry.register("record_dispatch", Arc::new(RecordDispatchHandler));
}

/// The incident engine's submission port, backed by the workflow engine.
pub struct DispatchSubmitter {
    engine: Arc<WorkflowEngine>,
    def: WorkflowDef,
    monitors: Arc<dyn MonitorRepo>,
}

impl DispatchSubmitter {
    pub fn new(engine: Arc<WorkflowEngine>, def: WorkflowDef, monitors: Arc<dyn MonitorRepo>) -> Self {
        Self {
            engine,
            def,
            monitors,
        }
    }
}

#[async_trait]
impl WorkflowSubmitter for DispatchSubmitter {
    async fn submit(&self, name: &str, input: Value) -> Result<Uuid, String> {
        if name != ALERT_DISPATCH_WORKFLOW {
            return Err(format!("unknown workflow '{name}'"));
        }
        // Workflows are tenant-scoped; recover the tenant from the monitor.
        let tenant_id = match serde_json::from_value::<AlertDispatchInput>(input.clone()) {
            Ok(parsed) => match self.monitors.get_monitor(parsed.monitor_id).await {
                Ok(Some(monitor)) => monitor.tenant_id,
                _ => "default".to_string(),
            },
            Err(e) => return Err(format!("bad dispatch input: {e}")),
        };
        self.engine
            .submit(&self.def, &tenant_id, input)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use wd_crypto::SecretBox;
    use wd_proto::{
        Agent, AgentStatus, IncidentStatus, MonitorStatus, MonitorType, WorkflowStatus,
    };
    use wd_store::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        store: Arc<MemoryStore>,
        deps: DispatchDeps,
        secrets: SecretBox,
        user_id: Uuid,
        agent_id: Uuid,
        monitor: Monitor,
        incident: Incident,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::in_memory());
        let secrets = SecretBox::new(&[5u8; 32]).expect("key");
        let user_id = Uuid::new_v4();

        let agent = Agent {
            id: Uuid::new_v4(),
            user_id,
            tenant_id: "t-1".to_string(),
            name: "edge-1".to_string(),
            api_key_encrypted: "sealed".to_string(),
            api_key_expires_at: None,
            status: AgentStatus::Online,
            last_seen_at: None,
            created_at: Utc::now(),
        };
        let agent_id = agent.id;
        store.create_agent(agent).await.expect("agent");

        let monitor = Monitor {
            id: Uuid::new_v4(),
            agent_id,
            tenant_id: "t-1".to_string(),
            name: "api".to_string(),
            kind: MonitorType::Http,
            target: "https://example.com/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 10,
            failure_threshold: 3,
            status: MonitorStatus::Down,
            enabled: true,
            created_at: Utc::now(),
        };
        store.create_monitor(monitor.clone()).await.expect("monitor");

        let incident = Incident {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            status: IncidentStatus::Open,
            started_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            ttr_seconds: None,
        };
        store.create_incident(incident.clone()).await.expect("incident");

        let deps = DispatchDeps {
            incidents: store.clone(),
            monitors: store.clone(),
            agents: store.clone(),
            channels: store.clone(),
            factory: Arc::new(NotifierFactory::new(secrets.clone())),
        };

        Fixture {
            store,
            deps,
            secrets,
            user_id,
            agent_id,
            monitor,
            incident,
        }
    }

    async fn seed_channel(fx: &Fixture, kind: ChannelType, url: &str, enabled: bool) -> Uuid {
        let key = match kind {
            ChannelType::Webhook => "url",
            _ => "webhook_url",
        };
        let mut config = HashMap::new();
        config.insert(key.to_string(), url.to_string());
        let channel = AlertChannel {
            id: Uuid::new_v4(),
            user_id: fx.user_id,
            tenant_id: "t-1".to_string(),
            kind,
            name: format!("{kind} channel"),
            config_encrypted: fx.secrets.seal_map(&config).expect("seal"),
            enabled,
        };
        let id = channel.id;
        fx.store.create_channel(channel).await.expect("channel");
        id
    }

    fn dispatch_input(fx: &Fixture, opened: bool) -> Value {
        serde_json::to_value(AlertDispatchInput {
            incident_id: fx.incident.id,
            monitor_id: fx.monitor.id,
            agent_id: fx.agent_id,
            opened,
        })
        .expect("encode")
    }

    fn ctx() -> StepContext {
        StepContext {
            workflow_id: Uuid::new_v4(),
            step_name: "test".to_string(),
            attempt: 1,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_channels_emits_ids_not_secrets() {
        let fx = fixture().await;
        seed_channel(&fx, ChannelType::Slack, "https://hooks.test/a", true).await;
        seed_channel(&fx, ChannelType::Discord, "https://hooks.test/b", true).await;
        seed_channel(&fx, ChannelType::Slack, "https://hooks.test/c", false).await;

        let handler = ResolveChannelsHandler {
            deps: fx.deps.clone(),
        };
        let output = handler
            .execute(&ctx(), dispatch_input(&fx, true))
            .await
            .expect("resolve");

        let payload: DispatchPayload =
            serde_json::from_value(output.clone()).expect("decode");
        assert_eq!(payload.channels.len(), 2, "disabled channels are excluded");
        assert_eq!(payload.incident.id, fx.incident.id);
        assert!(payload.opened);

        let raw = serde_json::to_string(&output).expect("serialize");
        assert!(
            !raw.contains("config_encrypted"),
            "sealed configs must not enter workflow history"
        );
        assert!(!raw.contains("hooks.test"), "no decrypted urls in payload");
    }

    #[tokio::test]
    async fn test_send_step_delivers_to_matching_type_only() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slack"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        seed_channel(&fx, ChannelType::Slack, &format!("{}/slack", server.uri()), true).await;
        seed_channel(&fx, ChannelType::Discord, &format!("{}/discord", server.uri()), true).await;

        let resolve = ResolveChannelsHandler {
            deps: fx.deps.clone(),
        };
        let payload = resolve
            .execute(&ctx(), dispatch_input(&fx, true))
            .await
            .expect("resolve");

        let send = SendChannelHandler {
            kind: ChannelType::Slack,
            deps: fx.deps.clone(),
        };
        let output = send.execute(&ctx(), payload.clone()).await.expect("send");
        assert_eq!(output, payload, "send steps pass the payload through");

        let requests = server.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 1, "only the slack channel is addressed");
        assert_eq!(requests[0].url.path(), "/slack");
    }

    #[tokio::test]
    async fn test_send_step_fails_when_all_channels_fail() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&server)
            .await;
        seed_channel(&fx, ChannelType::Slack, &server.uri(), true).await;

        let resolve = ResolveChannelsHandler {
            deps: fx.deps.clone(),
        };
        let payload = resolve
            .execute(&ctx(), dispatch_input(&fx, true))
            .await
            .expect("resolve");

        let send = SendChannelHandler {
            kind: ChannelType::Slack,
            deps: fx.deps.clone(),
        };
        let err = send
            .execute(&ctx(), payload)
            .await
            .expect_err("gateway timeouts must fail the step");
        assert!(err.contains("504"), "got: {err}");
    }

    #[tokio::test]
    async fn test_send_step_with_no_channels_is_trivial() {
        let fx = fixture().await;
        let resolve = ResolveChannelsHandler {
            deps: fx.deps.clone(),
        };
        let payload = resolve
            .execute(&ctx(), dispatch_input(&fx, false))
            .await
            .expect("resolve");

        let send = SendChannelHandler {
            kind: ChannelType::Pagerduty,
            deps: fx.deps.clone(),
        };
        send.execute(&ctx(), payload).await.expect("trivial success");
    }

    #[tokio::test]
    async fn test_full_dispatch_workflow_through_engine() {
        let fx = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        seed_channel(&fx, ChannelType::Webhook, &format!("{}/hook", server.uri()), true).await;

        let registry = Arc::new(HandlerRegistry::new());
        register_handlers(&registry, fx.deps.clone(), None);
        let engine = WorkflowEngine::new(fx.store.clone(), registry);
        let submitter = DispatchSubmitter::new(
            engine.clone(),
            alert_dispatch_def(false),
            fx.store.clone(),
        );

        let id = submitter
            .submit(ALERT_DISPATCH_WORKFLOW, dispatch_input(&fx, true))
            .await
            .expect("submit");
        engine.execute(id).await;

        let (workflow, steps) = engine.get(id).await.expect("get").expect("exists");
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.tenant_id, "t-1");
        assert_eq!(steps.len(), 2 + ChannelType::ALL.len());

        let requests = server.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value =
            serde_json::from_slice(&requests[0].body).expect("json body");
        assert_eq!(body["event"], "incident.opened");
        assert_eq!(body["incident"]["id"], fx.incident.id.to_string());
    }

    #[tokio::test]
    async fn test_submitter_rejects_unknown_workflow() {
        let fx = fixture().await;
        let registry = Arc::new(HandlerRegistry::new());
        let engine = WorkflowEngine::new(fx.store.clone(), registry);
        let submitter =
            DispatchSubmitter::new(engine, alert_dispatch_def(false), fx.store.clone());
        assert!(
            submitter
                .submit("something_else", Value::Null)
                .await
                .is_err()
        );
    }
}
