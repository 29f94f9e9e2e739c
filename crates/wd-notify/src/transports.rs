//! Per-channel delivery transports.
//!
//! The generic webhook body shape is part of the wire contract; the other
//! transports only promise a human-readable message per incident
//! transition.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use wd_proto::{Incident, IncidentStatus, Monitor, MonitorType};

use crate::{NOTIFY_TIMEOUT, Notifier, NotifyError, opened_text, resolved_text};

fn http_client(transport: &'static str) -> Result<reqwest::Client, NotifyError> {
    reqwest::Client::builder()
        .timeout(NOTIFY_TIMEOUT)
        .build()
        .map_err(|e| NotifyError::Transport {
            transport,
            message: e.to_string(),
        })
}

async fn post_json<T: Serialize>(
    client: &reqwest::Client,
    transport: &'static str,
    url: &str,
    body: &T,
) -> Result<(), NotifyError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| NotifyError::Transport {
            transport,
            message: e.to_string(),
        })?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NotifyError::Status {
            transport,
            status: status.as_u16(),
        })
    }
}

// ─── Generic webhook ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WebhookIncidentBody {
    id: Uuid,
    monitor_id: Uuid,
    status: IncidentStatus,
    started_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Serialize)]
struct WebhookMonitorBody {
    id: Uuid,
    name: String,
    #[serde(rename = "type")]
    kind: MonitorType,
    target: String,
}

#[derive(Serialize)]
struct WebhookBody {
    event: &'static str,
    timestamp: String,
    incident: WebhookIncidentBody,
    monitor: WebhookMonitorBody,
}

impl WebhookBody {
    fn new(event: &'static str, incident: &Incident, monitor: &Monitor) -> Self {
        Self {
            event,
            timestamp: Utc::now().to_rfc3339(),
            incident: WebhookIncidentBody {
                id: incident.id,
                monitor_id: incident.monitor_id,
                status: incident.status,
                started_at: incident.started_at,
                resolved_at: incident.resolved_at,
            },
            monitor: WebhookMonitorBody {
                id: monitor.id,
                name: monitor.name.clone(),
                kind: monitor.kind,
                target: monitor.target.clone(),
            },
        }
    }
}

/// Generic outbound webhook. `POST`, JSON body, any 2xx is success.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self, NotifyError> {
        Ok(Self {
            url,
            client: http_client("webhook")?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = WebhookBody::new("incident.opened", incident, monitor);
        post_json(&self.client, "webhook", &self.url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = WebhookBody::new("incident.resolved", incident, monitor);
        post_json(&self.client, "webhook", &self.url, &body).await
    }
}

// ─── Discord ─────────────────────────────────────────────────────────────────

pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Result<Self, NotifyError> {
        Ok(Self {
            webhook_url,
            client: http_client("discord")?,
        })
    }

    async fn send(&self, content: String) -> Result<(), NotifyError> {
        post_json(
            &self.client,
            "discord",
            &self.webhook_url,
            &serde_json::json!({ "content": content }),
        )
        .await
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(opened_text(incident, monitor)).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(resolved_text(incident, monitor)).await
    }
}

// ─── Slack ───────────────────────────────────────────────────────────────────

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Result<Self, NotifyError> {
        Ok(Self {
            webhook_url,
            client: http_client("slack")?,
        })
    }

    async fn send(&self, text: String) -> Result<(), NotifyError> {
        post_json(
            &self.client,
            "slack",
            &self.webhook_url,
            &serde_json::json!({ "text": text }),
        )
        .await
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(opened_text(incident, monitor)).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(resolved_text(incident, monitor)).await
    }
}

// ─── Telegram ────────────────────────────────────────────────────────────────

pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Result<Self, NotifyError> {
        Self::with_api_base(bot_token, chat_id, "https://api.telegram.org".to_string())
    }

    pub fn with_api_base(
        bot_token: String,
        chat_id: String,
        api_base: String,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            bot_token,
            chat_id,
            api_base,
            client: http_client("telegram")?,
        })
    }

    async fn send(&self, text: String) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        post_json(
            &self.client,
            "telegram",
            &url,
            &serde_json::json!({ "chat_id": self.chat_id, "text": text }),
        )
        .await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(opened_text(incident, monitor)).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send(resolved_text(incident, monitor)).await
    }
}

// ─── PagerDuty ───────────────────────────────────────────────────────────────

pub struct PagerDutyNotifier {
    routing_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl PagerDutyNotifier {
    pub fn new(routing_key: String) -> Result<Self, NotifyError> {
        Self::with_api_base(routing_key, "https://events.pagerduty.com".to_string())
    }

    pub fn with_api_base(routing_key: String, api_base: String) -> Result<Self, NotifyError> {
        Ok(Self {
            routing_key,
            api_base,
            client: http_client("pagerduty")?,
        })
    }

    async fn send(&self, event_action: &str, summary: String, incident: &Incident, monitor: &Monitor) -> Result<(), NotifyError> {
        let url = format!("{}/v2/enqueue", self.api_base);
        // Events API v2; the incident id doubles as the dedup key so open
        // and resolve land on the same PagerDuty alert.
        let body = serde_json::json!({
            "routing_key": self.routing_key,
            "event_action": event_action,
            "dedup_key": incident.id,
            "payload": {
                "summary": summary,
                "source": monitor.target,
                "severity": "critical",
            },
        });
        post_json(&self.client, "pagerduty", &url, &body).await
    }
}

#[async_trait]
impl Notifier for PagerDutyNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send("trigger", opened_text(incident, monitor), incident, monitor)
            .await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.send("resolve", resolved_text(incident, monitor), incident, monitor)
            .await
    }
}

// ─── Email ───────────────────────────────────────────────────────────────────

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(
        host: &str,
        port: &str,
        username: &str,
        password: &str,
        from: &str,
        to: &str,
    ) -> Result<Self, NotifyError> {
        let port: u16 = port
            .parse()
            .map_err(|_| NotifyError::Config(format!("invalid smtp port '{port}'")))?;
        let from: Mailbox = from
            .parse()
            .map_err(|_| NotifyError::Config(format!("invalid from address '{from}'")))?;
        let to = to
            .split(',')
            .map(|addr| {
                addr.trim()
                    .parse::<Mailbox>()
                    .map_err(|_| NotifyError::Config(format!("invalid to address '{addr}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Config("no recipient addresses".to_string()));
        }

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| NotifyError::Transport {
                transport: "email",
                message: e.to_string(),
            })?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .timeout(Some(NOTIFY_TIMEOUT))
            .build();

        Ok(Self {
            transport,
            from,
            to,
        })
    }

    async fn send(&self, subject: String, body: String) -> Result<(), NotifyError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        let message = builder.body(body).map_err(|e| NotifyError::Transport {
            transport: "email",
            message: e.to_string(),
        })?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport {
                transport: "email",
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let subject = format!("[WatchDog] {} is down", monitor.name);
        self.send(subject, opened_text(incident, monitor)).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let subject = format!("[WatchDog] {} recovered", monitor.name);
        self.send(subject, resolved_text(incident, monitor)).await
    }
}
