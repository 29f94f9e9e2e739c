//! Alert channel notifiers.
//!
//! A [`Notifier`] delivers an incident transition to a single channel. The
//! [`NotifierFactory`] builds one from a stored [`AlertChannel`], decrypting
//! its config on demand. Notifiers never retry internally; the workflow
//! engine owns retry.

#![forbid(unsafe_code)]

pub mod transports;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use wd_crypto::{CryptoError, SecretBox};
use wd_proto::{AlertChannel, ChannelType, Incident, Monitor};

pub use transports::{
    DiscordNotifier, EmailNotifier, PagerDutyNotifier, SlackNotifier, TelegramNotifier,
    WebhookNotifier,
};

/// Deadline applied to every outbound notification call.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("channel config invalid: {0}")]
    Config(String),

    #[error("channel config could not be decrypted: {0}")]
    Decrypt(#[from] CryptoError),

    #[error("{transport} returned http {status}")]
    Status { transport: &'static str, status: u16 },

    #[error("{transport} transport error: {message}")]
    Transport {
        transport: &'static str,
        message: String,
    },

    #[error("{failed}/{total} notifiers failed: {detail}")]
    Fanout {
        failed: usize,
        total: usize,
        detail: String,
    },
}

/// Delivery adapter for one channel. Implementations must be safe to call
/// concurrently and must not retry internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError>;

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError>;
}

impl std::fmt::Debug for dyn Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Notifier>")
    }
}

// ─── Message text ────────────────────────────────────────────────────────────

/// Plain-text summary for an opened incident, shared by the chat-style
/// transports.
pub fn opened_text(incident: &Incident, monitor: &Monitor) -> String {
    format!(
        "[WatchDog] monitor '{}' ({} {}) is DOWN since {}",
        monitor.name,
        monitor.kind,
        monitor.target,
        incident.started_at.to_rfc3339(),
    )
}

/// Plain-text summary for a resolved incident.
pub fn resolved_text(incident: &Incident, monitor: &Monitor) -> String {
    match incident.ttr_seconds {
        Some(ttr) => format!(
            "[WatchDog] monitor '{}' ({} {}) recovered after {}s",
            monitor.name, monitor.kind, monitor.target, ttr,
        ),
        None => format!(
            "[WatchDog] monitor '{}' ({} {}) recovered",
            monitor.name, monitor.kind, monitor.target,
        ),
    }
}

// ─── Composition ─────────────────────────────────────────────────────────────

/// Calls a set of notifiers sequentially, collecting failures instead of
/// stopping at the first one.
pub struct MultiNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    fn collect(&self, failures: Vec<String>) -> Result<(), NotifyError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Fanout {
                failed: failures.len(),
                total: self.notifiers.len(),
                detail: failures.join("; "),
            })
        }
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify_incident_opened(incident, monitor).await {
                failures.push(e.to_string());
            }
        }
        self.collect(failures)
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify_incident_resolved(incident, monitor).await {
                failures.push(e.to_string());
            }
        }
        self.collect(failures)
    }
}

/// Used when no channels are configured.
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        _monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        debug!(incident = %incident.id, "no notifier configured, dropping open notification");
        Ok(())
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        _monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        debug!(incident = %incident.id, "no notifier configured, dropping resolve notification");
        Ok(())
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Builds a typed notifier from a stored channel record, decrypting its
/// config on demand. Decrypted values live only inside the returned
/// notifier; they are never persisted.
pub struct NotifierFactory {
    secrets: SecretBox,
}

impl NotifierFactory {
    pub fn new(secrets: SecretBox) -> Self {
        Self { secrets }
    }

    pub fn build_from_channel(
        &self,
        channel: &AlertChannel,
    ) -> Result<Box<dyn Notifier>, NotifyError> {
        let config = self.secrets.open_map(&channel.config_encrypted)?;
        for key in channel.kind.required_keys() {
            if config.get(*key).is_none_or(|v| v.is_empty()) {
                return Err(NotifyError::Config(format!(
                    "channel {} ({}): missing config key '{key}'",
                    channel.id, channel.kind,
                )));
            }
        }
        let get = |key: &str| config.get(key).cloned().unwrap_or_default();

        Ok(match channel.kind {
            ChannelType::Discord => Box::new(DiscordNotifier::new(get("webhook_url"))?),
            ChannelType::Slack => Box::new(SlackNotifier::new(get("webhook_url"))?),
            ChannelType::Webhook => Box::new(WebhookNotifier::new(get("url"))?),
            ChannelType::Telegram => {
                Box::new(TelegramNotifier::new(get("bot_token"), get("chat_id"))?)
            }
            ChannelType::Pagerduty => Box::new(PagerDutyNotifier::new(get("routing_key"))?),
            ChannelType::Email => Box::new(EmailNotifier::new(
                &get("host"),
                &get("port"),
                &get("username"),
                &get("password"),
                &get("from"),
                &get("to"),
            )?),
        })
    }
}

/// Environment-level default notifiers, fed to the `send_global` dispatch
/// step. Returns `None` when no variables are set.
pub fn global_from_env() -> Result<Option<MultiNotifier>, NotifyError> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
    if let Ok(url) = std::env::var("WATCHDOG_SLACK_WEBHOOK_URL")
        && !url.is_empty()
    {
        notifiers.push(Box::new(SlackNotifier::new(url)?));
    }
    if let Ok(url) = std::env::var("WATCHDOG_DISCORD_WEBHOOK_URL")
        && !url.is_empty()
    {
        notifiers.push(Box::new(DiscordNotifier::new(url)?));
    }
    if let Ok(url) = std::env::var("WATCHDOG_WEBHOOK_URL")
        && !url.is_empty()
    {
        notifiers.push(Box::new(WebhookNotifier::new(url)?));
    }
    if notifiers.is_empty() {
        Ok(None)
    } else {
        Ok(Some(MultiNotifier::new(notifiers)))
    }
}
