//! Spug xsend transport: builds reminder messages and delivers them with
//! bounded retry, grounded on the collector's Spug notifier client.

use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::Value;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::config::Config;
use crate::error::CoreError;
use crate::model::{Details, Section};

/// A single HTTP round-trip to the push endpoint, abstracted so tests can
/// substitute an in-memory double for the retry/backoff behavior instead of
/// hitting the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        url: &str,
        payload: &Value,
        token: Option<&str>,
    ) -> Result<(u16, String), CoreError>;
}

struct ReqwestTransport {
    client: Client,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        url: &str,
        payload: &Value,
        token: Option<&str>,
    ) -> Result<(u16, String), CoreError> {
        let mut request = self.client.get(url).query(payload);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Transport { status: None, body: e.to_string() })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::Transport { status: Some(status), body: e.to_string() })?;
        Ok((status, body))
    }
}

fn build_client(config: &NotifierConfig) -> Result<Client, CoreError> {
    let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_seconds));
    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| CoreError::Transport { status: None, body: e.to_string() })?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| CoreError::Transport { status: None, body: e.to_string() })
}

/// Everything the notifier needs that doesn't change between sends.
#[derive(Clone)]
pub struct NotifierConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_seconds: u64,
    pub channel: String,
    pub quiet_channel: Option<String>,
    pub xsend_user_id: Option<String>,
    pub proxy: Option<String>,
}

impl From<&Config> for NotifierConfig {
    fn from(cfg: &Config) -> Self {
        NotifierConfig {
            base_url: cfg.spug_base_url.clone(),
            token: cfg.spug_token.clone(),
            timeout_seconds: cfg.spug_timeout_seconds,
            channel: cfg.spug_channel.clone(),
            quiet_channel: cfg.spug_quiet_channel.clone(),
            xsend_user_id: cfg.spug_xsend_user_id.clone(),
            proxy: cfg.spug_proxy.clone(),
        }
    }
}

/// The rendered outcome of a single send attempt, used for the audit log.
#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub endpoint: String,
    pub payload: Value,
    pub status_code: Option<u16>,
    pub response_body: Option<Value>,
}

/// Everything needed to render a reminder's title/body, independent of how
/// it is persisted.
#[derive(Debug, Clone)]
pub struct ReminderContext {
    pub token: String,
    pub section: Section,
    pub start_time: Option<chrono::DateTime<Tz>>,
    pub raw_time: Option<String>,
    pub offset_minutes: Option<i64>,
    pub details: Details,
}

pub struct Notifier {
    config: NotifierConfig,
    transport: Box<dyn Transport>,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Result<Self, CoreError> {
        let client = build_client(&config)?;
        Ok(Notifier { config, transport: Box::new(ReqwestTransport { client }) })
    }

    /// Builds a notifier over a caller-supplied transport, bypassing the
    /// real HTTP client entirely. Used by tests to exercise the retry
    /// policy without a network.
    pub fn with_transport(config: NotifierConfig, transport: Box<dyn Transport>) -> Self {
        Notifier { config, transport }
    }

    fn build_message(&self, ctx: &ReminderContext, quiet_mode: bool) -> (String, String) {
        let title = match ctx.start_time {
            Some(st) => format!("[Alpha] {} {}", ctx.token, st.format("%Y-%m-%d %H:%M")),
            None => format!("[Alpha] {}", ctx.token),
        };

        let mut lines = vec![format!("Section: {}", ctx.section)];
        match ctx.start_time {
            Some(st) => lines.push(format!("Start: {}", st.format("%Y-%m-%d %H:%M %Z"))),
            None => lines.push(format!("Time: {}", ctx.raw_time.as_deref().unwrap_or("TBA"))),
        }
        if let Some(offset) = ctx.offset_minutes {
            lines.push(format!("Reminder: T-{offset} min"));
        }
        if quiet_mode {
            lines.push("Quiet hours fallback channel".to_string());
        }
        for (key, value) in &ctx.details {
            let rendered = match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            if let Some(rendered) = rendered {
                lines.push(format!("{key}: {rendered}"));
            }
        }

        (title, lines.join("\n"))
    }

    /// Sends a reminder through Spug's xsend endpoint, retrying transport
    /// failures up to three times with 1s/2s backoff.
    pub async fn send(
        &self,
        ctx: &ReminderContext,
        quiet_mode: bool,
    ) -> Result<NotificationResult, CoreError> {
        let Some(xsend_user_id) = self.config.xsend_user_id.clone() else {
            return Err(CoreError::ConfigIncomplete(
                "Spug configuration incomplete. Provide SPUG_XSEND_USER_ID.".to_string(),
            ));
        };

        let (title, content) = self.build_message(ctx, quiet_mode);
        let channel = if quiet_mode {
            self.config.quiet_channel.clone().unwrap_or_else(|| self.config.channel.clone())
        } else {
            self.config.channel.clone()
        };

        let payload = serde_json::json!({
            "title": title,
            "content": content,
            "channel": channel,
        });

        let strategy = ExponentialBackoff::from_millis(1000)
            .max_delay(Duration::from_secs(8))
            .take(2);

        let url = format!("{}/xsend/{}", self.config.base_url.trim_end_matches('/'), xsend_user_id);
        let token = self.config.token.clone();
        let transport = self.transport.as_ref();

        let (status, body_text) = Retry::spawn(strategy, || {
            attempt_send(transport, &url, &payload, token.as_deref())
        })
        .await?;

        let response_body: Option<Value> = serde_json::from_str(&body_text).ok();
        Ok(NotificationResult {
            endpoint: "/xsend".to_string(),
            payload,
            status_code: Some(status),
            response_body,
        })
    }
}

async fn attempt_send(
    transport: &dyn Transport,
    url: &str,
    payload: &Value,
    token: Option<&str>,
) -> Result<(u16, String), CoreError> {
    let (status, body) = transport.send(url, payload, token).await?;
    if status >= 300 {
        return Err(CoreError::Transport { status: Some(status), body });
    }
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    struct FakeTransport {
        attempts: Arc<AtomicUsize>,
        /// Status/body pairs returned in order, one per call; the last
        /// entry repeats once exhausted.
        responses: Mutex<Vec<(u16, String)>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            _url: &str,
            _payload: &Value,
            _token: Option<&str>,
        ) -> Result<(u16, String), CoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    fn notifier_config() -> NotifierConfig {
        NotifierConfig {
            base_url: "https://push.spug.cc".to_string(),
            token: None,
            timeout_seconds: 10,
            channel: "voice".to_string(),
            quiet_channel: None,
            xsend_user_id: Some("user".to_string()),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn send_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let transport = FakeTransport {
            attempts: attempts.clone(),
            responses: Mutex::new(vec![
                (503, "unavailable".to_string()),
                (503, "unavailable".to_string()),
                (200, "{\"code\":0}".to_string()),
            ]),
        };
        let notifier = Notifier::with_transport(notifier_config(), Box::new(transport));
        let result = notifier.send(&ctx(), false).await.unwrap();
        assert_eq!(result.status_code, Some(200));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn send_surfaces_transport_error_after_exhausting_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let transport = FakeTransport {
            attempts: attempts.clone(),
            responses: Mutex::new(vec![(503, "unavailable".to_string())]),
        };
        let notifier = Notifier::with_transport(notifier_config(), Box::new(transport));
        let err = notifier.send(&ctx(), false).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport { status: Some(503), .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    fn ctx() -> ReminderContext {
        ReminderContext {
            token: "ALPHA".to_string(),
            section: Section::Today,
            start_time: None,
            raw_time: Some("TBA".to_string()),
            offset_minutes: None,
            details: Details::new(),
        }
    }

    #[test]
    fn build_message_uses_tba_title_when_start_time_missing() {
        let notifier = Notifier::new(NotifierConfig {
            base_url: "https://push.spug.cc".to_string(),
            token: None,
            timeout_seconds: 10,
            channel: "voice".to_string(),
            quiet_channel: None,
            xsend_user_id: Some("user".to_string()),
            proxy: None,
        })
        .unwrap();
        let (title, body) = notifier.build_message(&ctx(), false);
        assert_eq!(title, "[Alpha] ALPHA");
        assert!(body.contains("Time: TBA"));
        assert!(!body.contains("Quiet hours"));
    }

    #[test]
    fn build_message_notes_quiet_mode() {
        let notifier = Notifier::new(NotifierConfig {
            base_url: "https://push.spug.cc".to_string(),
            token: None,
            timeout_seconds: 10,
            channel: "voice".to_string(),
            quiet_channel: Some("text".to_string()),
            xsend_user_id: Some("user".to_string()),
            proxy: None,
        })
        .unwrap();
        let (_, body) = notifier.build_message(&ctx(), true);
        assert!(body.contains("Quiet hours fallback channel"));
    }
}
