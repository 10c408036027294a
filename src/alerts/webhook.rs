//! HTTP webhook channels (Slack, Teams, generic JSON) and the log channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{AlertChannel, Envelope, SendError};
use crate::config::{ChannelConfig, ChannelKind};
use crate::detect::Severity;

/// Map an HTTP status to a send outcome.
///
/// 429 and 5xx are worth retrying; any other non-success is a rejection
/// that will not improve on retry.
pub fn classify_status(status: StatusCode) -> Result<(), SendError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(SendError::Transient(format!("HTTP {}", status)))
    } else {
        Err(SendError::Permanent(format!("HTTP {}", status)))
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> SendError {
    if e.is_builder() || e.is_redirect() {
        SendError::Permanent(e.to_string())
    } else {
        SendError::Transient(e.to_string())
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#D00000",
        Severity::Warning => "#F2C744",
        Severity::Info => "#439FE0",
    }
}

/// Slack incoming-webhook body.
pub fn slack_payload(env: &Envelope) -> Value {
    let fields: Vec<Value> = env
        .metadata
        .iter()
        .filter(|(k, _)| k.as_str() != "recommendations")
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            json!({ "title": k, "value": value, "short": true })
        })
        .collect();
    json!({
        "text": format!("*[{}] {}*", env.severity.to_string().to_uppercase(), env.title),
        "attachments": [{
            "color": severity_color(env.severity),
            "text": env.description,
            "fields": fields,
        }]
    })
}

/// Teams connector MessageCard body.
pub fn teams_payload(env: &Envelope) -> Value {
    let facts: Vec<Value> = env
        .metadata
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v.to_string() }))
        .collect();
    json!({
        "@type": "MessageCard",
        "@context": "https://schema.org/extensions",
        "summary": env.title,
        "themeColor": severity_color(env.severity).trim_start_matches('#'),
        "title": format!("[{}] {}", env.severity.to_string().to_uppercase(), env.title),
        "text": env.description,
        "sections": [{ "facts": facts }]
    })
}

pub struct WebhookChannel {
    name: String,
    kind: ChannelKind,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: &str, kind: ChannelKind, url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            kind,
            url: url.to_string(),
            client,
        })
    }

    fn payload(&self, env: &Envelope) -> Value {
        match self.kind {
            ChannelKind::Slack => slack_payload(env),
            ChannelKind::Teams => teams_payload(env),
            ChannelKind::Webhook | ChannelKind::Log => json!(env),
        }
    }
}

#[async_trait::async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&self.payload(envelope))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        classify_status(resp.status())
    }
}

/// Writes alerts to the agent's own log. Never fails.
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        match envelope.severity {
            Severity::Critical => tracing::error!(channel = %self.name, title = %envelope.title, "{}", envelope.description),
            Severity::Warning => tracing::warn!(channel = %self.name, title = %envelope.title, "{}", envelope.description),
            Severity::Info => tracing::info!(channel = %self.name, title = %envelope.title, "{}", envelope.description),
        }
        Ok(())
    }
}

/// Build the channel described by one `[[channels]]` entry.
pub fn build_channel(cfg: &ChannelConfig, timeout: Duration) -> Result<Arc<dyn AlertChannel>> {
    match cfg.kind {
        ChannelKind::Log => Ok(Arc::new(LogChannel::new(&cfg.name))),
        kind => {
            let url = cfg
                .url
                .as_deref()
                .with_context(|| format!("channel '{}' has no url", cfg.name))?;
            Ok(Arc::new(WebhookChannel::new(&cfg.name, kind, url, timeout)?))
        }
    }
}
