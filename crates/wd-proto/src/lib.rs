//! Protocol types for the WatchDog hub/agent protocol.
//!
//! Defines the domain entities shared by all hub-side crates and the framed
//! messages exchanged between the hub and monitoring agents over the
//! full-duplex agent transport.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Limits & defaults ───────────────────────────────────────────────────────

/// Check interval bounds (seconds).
pub const MIN_INTERVAL_SECS: u32 = 5;
pub const MAX_INTERVAL_SECS: u32 = 3600;
pub const DEFAULT_INTERVAL_SECS: u32 = 30;

/// Check timeout bounds (seconds).
pub const MIN_TIMEOUT_SECS: u32 = 1;
pub const MAX_TIMEOUT_SECS: u32 = 60;
pub const DEFAULT_TIMEOUT_SECS: u32 = 10;

/// Consecutive failures before an incident opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Maximum size of a single transport frame. Exceeding frames close the
/// connection.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Length of the hex-encoded agent API secret (32 bytes).
pub const API_SECRET_HEX_LEN: usize = 64;

// ─── Monitor types & statuses ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
    Ping,
    Dns,
    Tls,
    Docker,
    Database,
    System,
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Tcp => write!(f, "tcp"),
            Self::Ping => write!(f, "ping"),
            Self::Dns => write!(f, "dns"),
            Self::Tls => write!(f, "tls"),
            Self::Docker => write!(f, "docker"),
            Self::Database => write!(f, "database"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    #[default]
    Pending,
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Up,
    Down,
    Timeout,
    Error,
}

impl HeartbeatStatus {
    /// `down`, `timeout` and `error` are equivalent for the strike counter;
    /// only `up` resets it.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Up)
    }
}

/// A single check result produced by an agent for a monitor. Append-only,
/// ordered by `time` within a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub time: DateTime<Utc>,
    pub monitor_id: Uuid,
    pub agent_id: Uuid,
    pub status: HeartbeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ─── Incident ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// A durable record of a period during which a monitor was considered down.
///
/// Invariants: at most one non-resolved incident per monitor;
/// `resolved_at >= started_at`; `ttr_seconds = floor(resolved_at - started_at)`
/// once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttr_seconds: Option<i64>,
}

impl Incident {
    pub fn is_resolved(&self) -> bool {
        self.status == IncidentStatus::Resolved
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// A single assigned check: type, target, cadence and failure threshold.
///
/// `status` is written only by the incident engine (with one exception: the
/// monitor service marks monitors down when their agent disconnects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MonitorType,
    pub target: String,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub failure_threshold: u32,
    pub status: MonitorStatus,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// A remote process that connects to the hub and executes checks.
///
/// The API key has the wire form `<agent_id>:<hex_secret>`; only the secret
/// is stored, AEAD-sealed. `status` is derived from live hub sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub api_key_encrypted: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_expires_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ─── User & plans ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// Per-plan resource ceilings, enforced at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_agents: u32,
    pub max_monitors: u32,
}

impl Plan {
    pub fn limits(self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                max_agents: 3,
                max_monitors: 10,
            },
            Self::Pro => PlanLimits {
                max_agents: 10,
                max_monitors: 100,
            },
            Self::Enterprise => PlanLimits {
                max_agents: u32::MAX,
                max_monitors: u32::MAX,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub plan: Plan,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

// ─── Alert channels ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Discord,
    Slack,
    Webhook,
    Email,
    Telegram,
    Pagerduty,
}

impl ChannelType {
    /// All channel types, in dispatch order.
    pub const ALL: [ChannelType; 6] = [
        Self::Discord,
        Self::Slack,
        Self::Webhook,
        Self::Email,
        Self::Telegram,
        Self::Pagerduty,
    ];

    /// Config keys that must be present (non-empty) for this channel type.
    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            Self::Discord | Self::Slack => &["webhook_url"],
            Self::Webhook => &["url"],
            Self::Email => &["host", "port", "username", "password", "from", "to"],
            Self::Telegram => &["bot_token", "chat_id"],
            Self::Pagerduty => &["routing_key"],
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discord => write!(f, "discord"),
            Self::Slack => write!(f, "slack"),
            Self::Webhook => write!(f, "webhook"),
            Self::Email => write!(f, "email"),
            Self::Telegram => write!(f, "telegram"),
            Self::Pagerduty => write!(f, "pagerduty"),
        }
    }
}

/// An alert delivery channel owned by a user. `config_encrypted` is an
/// AEAD-sealed string→string mapping whose recognized keys depend on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub name: String,
    pub config_encrypted: String,
    pub enabled: bool,
}

// ─── Workflows ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-step action once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Skip,
    Retry,
}

/// A persisted, resumable sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_step: u32,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub max_retries: u32,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_index: u32,
    pub name: String,
    pub handler: String,
    pub status: StepStatus,
    pub on_failure: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ─── Wire frames ─────────────────────────────────────────────────────────────

/// Frame type tags used on the agent transport.
pub mod frame {
    /// Agent → hub, first frame of a session.
    pub const AUTH: &str = "auth";
    /// Agent → hub.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Agent → hub (JSON-level pong; transport pongs are preferred).
    pub const PONG: &str = "pong";
    /// Hub → agent.
    pub const MONITOR_ASSIGN: &str = "monitor.assign";
    /// Hub → agent.
    pub const MONITOR_REMOVE: &str = "monitor.remove";
    /// Hub → agent (JSON-level ping; transport pings are preferred).
    pub const PING: &str = "ping";
}

/// A single textual JSON frame: `{ "type": "<string>", "payload": <object> }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn auth(api_key: &str) -> Self {
        Self::new(
            frame::AUTH,
            serde_json::json!({ "api_key": api_key }),
        )
    }

    pub fn heartbeat(payload: &HeartbeatPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(frame::HEARTBEAT, serde_json::to_value(payload)?))
    }

    pub fn monitor_assign(monitor: &Monitor) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            frame::MONITOR_ASSIGN,
            serde_json::to_value(monitor)?,
        ))
    }

    pub fn monitor_remove(monitor_id: Uuid) -> Self {
        Self::new(
            frame::MONITOR_REMOVE,
            serde_json::json!({ "monitor_id": monitor_id }),
        )
    }

    /// Decode the payload as a typed value.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of a `heartbeat` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub monitor_id: Uuid,
    pub status: HeartbeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Payload of an `auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub api_key: String,
}

/// Payload of a `monitor.remove` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRemovePayload {
    pub monitor_id: Uuid,
}

// ─── API key format ──────────────────────────────────────────────────────────

/// Split an API key of the wire form `<agent_uuid>:<hex_secret>` on the
/// first `:`. Returns `None` when the shape is wrong.
pub fn split_api_key(key: &str) -> Option<(Uuid, &str)> {
    let (id, secret) = key.split_once(':')?;
    let id = Uuid::parse_str(id).ok()?;
    Some((id, secret))
}

// ─── Target validation ───────────────────────────────────────────────────────

/// Validate a monitor target against the shape its type expects:
/// URL for http, `host:port` for tcp/database, hostname for dns/tls/ping.
pub fn validate_target(kind: MonitorType, target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("target must not be empty".to_string());
    }
    match kind {
        MonitorType::Http => {
            let url = url::Url::parse(target).map_err(|e| format!("invalid url: {e}"))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(format!("unsupported scheme '{}'", url.scheme()));
            }
            if url.host_str().is_none() {
                return Err("url has no host".to_string());
            }
            Ok(())
        }
        MonitorType::Tcp | MonitorType::Database => {
            let (host, port) = target
                .rsplit_once(':')
                .ok_or_else(|| "expected host:port".to_string())?;
            if host.is_empty() || !is_valid_hostname(host.trim_matches(['[', ']'])) {
                return Err(format!("invalid host '{host}'"));
            }
            match port.parse::<u16>() {
                Ok(p) if p > 0 => Ok(()),
                _ => Err(format!("invalid port '{port}'")),
            }
        }
        MonitorType::Dns | MonitorType::Tls | MonitorType::Ping => {
            if is_valid_hostname(target) {
                Ok(())
            } else {
                Err(format!("invalid hostname '{target}'"))
            }
        }
        MonitorType::Docker => {
            if target
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                Ok(())
            } else {
                Err(format!("invalid container name '{target}'"))
            }
        }
        MonitorType::System => Ok(()),
    }
}

/// RFC-1123-ish hostname check, also accepting bare IPv4/IPv6 literals.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_type_display() {
        assert_eq!(MonitorType::Http.to_string(), "http");
        assert_eq!(MonitorType::Database.to_string(), "database");
        assert_eq!(ChannelType::Pagerduty.to_string(), "pagerduty");
    }

    #[test]
    fn test_heartbeat_failure_semantics() {
        assert!(!HeartbeatStatus::Up.is_failure());
        assert!(HeartbeatStatus::Down.is_failure());
        assert!(HeartbeatStatus::Timeout.is_failure());
        assert!(HeartbeatStatus::Error.is_failure());
    }

    #[test]
    fn test_monitor_serializes_type_field() {
        let m = Monitor {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            tenant_id: "t-1".to_string(),
            name: "api".to_string(),
            kind: MonitorType::Http,
            target: "https://example.com/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 10,
            failure_threshold: 3,
            status: MonitorStatus::Pending,
            enabled: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&m).expect("serialize");
        assert!(json.contains(r#""type":"http""#), "missing type tag: {json}");
        let back: Monitor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, MonitorType::Http);
    }

    #[test]
    fn test_envelope_heartbeat_roundtrip_preserves_monitor_id() {
        let monitor_id = Uuid::new_v4();
        let payload = HeartbeatPayload {
            monitor_id,
            status: HeartbeatStatus::Up,
            latency_ms: Some(42),
            error_message: None,
        };
        let env = Envelope::heartbeat(&payload).expect("encode");
        let wire = serde_json::to_string(&env).expect("serialize");
        assert!(wire.contains(r#""type":"heartbeat""#));

        let parsed: Envelope = serde_json::from_str(&wire).expect("parse");
        let back: HeartbeatPayload = parsed.decode().expect("decode");
        assert_eq!(back.monitor_id, monitor_id);
        assert_eq!(back.latency_ms, Some(42));
    }

    #[test]
    fn test_heartbeat_payload_omits_empty_optionals() {
        let payload = HeartbeatPayload {
            monitor_id: Uuid::new_v4(),
            status: HeartbeatStatus::Down,
            latency_ms: None,
            error_message: None,
        };
        let s = serde_json::to_string(&payload).expect("serialize");
        assert!(!s.contains("latency_ms"), "latency must be omitted: {s}");
        assert!(!s.contains("error_message"), "error must be omitted: {s}");
    }

    #[test]
    fn test_split_api_key() {
        let id = Uuid::new_v4();
        let key = format!("{id}:{}", "ab".repeat(32));
        let (parsed, secret) = split_api_key(&key).expect("split");
        assert_eq!(parsed, id);
        assert_eq!(secret.len(), API_SECRET_HEX_LEN);

        assert!(split_api_key("no-colon-here").is_none());
        assert!(split_api_key("not-a-uuid:secret").is_none());
    }

    #[test]
    fn test_validate_target_http() {
        assert!(validate_target(MonitorType::Http, "https://example.com/health").is_ok());
        assert!(validate_target(MonitorType::Http, "http://10.0.0.1:8080/").is_ok());
        assert!(validate_target(MonitorType::Http, "ftp://example.com").is_err());
        assert!(validate_target(MonitorType::Http, "not a url").is_err());
    }

    #[test]
    fn test_validate_target_tcp() {
        assert!(validate_target(MonitorType::Tcp, "db.internal:5432").is_ok());
        assert!(validate_target(MonitorType::Tcp, "10.0.0.5:22").is_ok());
        assert!(validate_target(MonitorType::Tcp, "no-port").is_err());
        assert!(validate_target(MonitorType::Tcp, "host:0").is_err());
        assert!(validate_target(MonitorType::Tcp, "host:99999").is_err());
    }

    #[test]
    fn test_validate_target_hostname_kinds() {
        assert!(validate_target(MonitorType::Dns, "example.com").is_ok());
        assert!(validate_target(MonitorType::Ping, "10.1.2.3").is_ok());
        assert!(validate_target(MonitorType::Tls, "-bad.example.com").is_err());
        assert!(validate_target(MonitorType::Dns, "").is_err());
    }

    #[test]
    fn test_channel_required_keys() {
        assert_eq!(ChannelType::Discord.required_keys(), &["webhook_url"]);
        assert_eq!(ChannelType::Webhook.required_keys(), &["url"]);
        assert_eq!(ChannelType::Email.required_keys().len(), 6);
        assert_eq!(ChannelType::Pagerduty.required_keys(), &["routing_key"]);
    }

    #[test]
    fn test_plan_limits() {
        assert_eq!(Plan::Free.limits().max_monitors, 10);
        assert!(Plan::Enterprise.limits().max_monitors > Plan::Pro.limits().max_monitors);
    }

    #[test]
    fn test_workflow_status_terminal() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }
}
