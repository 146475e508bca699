use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use url::Url;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator notification channel. `notify` must not block the caller on
/// delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes alerts to the log only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, message: &str) {
        error!(alert = message, "listener alert");
    }
}

#[derive(Debug, thiserror::Error)]
enum WebhookError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Serialize)]
struct WebhookBody {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

/// Posts `{"text": ..., "username": ...}` to a chat webhook.
pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: Url,
    username: Option<String>,
}

impl WebhookAlertSink {
    pub fn new(url: Url, username: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            http,
            url,
            username,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, message: &str) {
        warn!(alert = message, "sending listener alert");
        let http = self.http.clone();
        let url = self.url.clone();
        let body = WebhookBody {
            text: message.to_string(),
            username: self.username.clone(),
        };
        tokio::spawn(async move {
            match post_webhook(&http, url, &body).await {
                Ok(()) => debug!("alert delivered"),
                Err(err) => warn!(?err, "failed to deliver alert"),
            }
        });
    }
}

async fn post_webhook(
    http: &reqwest::Client,
    url: Url,
    body: &WebhookBody,
) -> Result<(), WebhookError> {
    let resp = http.post(url).json(body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(WebhookError::HttpStatus { status, body });
    }
    Ok(())
}

/// At most one alert per `cooldown`. Suppressed alerts do not extend the
/// window.
#[derive(Debug)]
pub struct AlertGate {
    cooldown: Duration,
    last_alert: Option<Instant>,
}

impl AlertGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: None,
        }
    }

    pub fn should_alert(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_alert
            && now.saturating_duration_since(last) < self.cooldown
        {
            return false;
        }
        self.last_alert = Some(now);
        true
    }
}
