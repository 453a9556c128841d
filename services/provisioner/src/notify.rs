//! Failure notifications.
//!
//! A failed provisioning run publishes one human-readable line to a fixed
//! topic so an operator can reconcile by hand. Delivery is best effort: a
//! sink failure is logged and never replaces the error that caused it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use voldr_id::InstanceId;

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink rejected message: {status} - {body}")]
    Rejected { status: u16, body: String },

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for diagnostic messages.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError>;
}

/// What went wrong in a provisioning run.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub instance_id: InstanceId,

    /// Best-known volume reference, if a record was resolved.
    pub volume_id: Option<String>,

    /// Last state the run reached before failing.
    pub last_state: &'static str,

    pub reason_code: &'static str,
    pub error: String,
}

impl FailureReport {
    /// Render the report as one line.
    pub fn message(&self) -> String {
        let volume = self.volume_id.as_deref().unwrap_or("unknown volume");

        format!(
            concat!(
                "Error provisioning master volume, instanceId: {}, volumeId: {}, ",
                "last state: {}, reason: {}, error: {}"
            ),
            self.instance_id, volume, self.last_state, self.reason_code, self.error
        )
    }
}

/// Publishes failure reports to the configured topic.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    topic: String,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
        }
    }

    /// Publish a failure report. Never fails.
    pub async fn notify_failure(&self, report: &FailureReport) {
        let message = report.message();
        match self.sink.publish(&self.topic, &message).await {
            Ok(()) => info!(
                topic = %self.topic,
                instance_id = %report.instance_id,
                "Failure notification published"
            ),
            Err(e) => error!(
                topic = %self.topic,
                instance_id = %report.instance_id,
                error = %e,
                message = %message,
                "Failed to publish failure notification"
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    topic: &'a str,
    message: &'a str,
    sent_at: DateTime<Utc>,
}

/// Delivers messages as JSON to an HTTP endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        debug!(url = %self.url, topic = %topic, "Publishing notification");

        let payload = WebhookPayload {
            topic,
            message,
            sent_at: Utc::now(),
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }

        Ok(())
    }
}

/// Writes messages to the log when no delivery endpoint is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        warn!(topic = %topic, notification = %message, "Notification");
        Ok(())
    }
}

/// Keeps published messages in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<(String, String)>>,
    fail_with: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every message.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail_with: Some(reason.into()),
        }
    }

    /// `(topic, message)` pairs delivered so far.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        if let Some(reason) = &self.fail_with {
            return Err(NotifyError::Unavailable(reason.clone()));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn report(volume_id: Option<&str>) -> FailureReport {
        FailureReport {
            instance_id: InstanceId::parse("i-06fc91a93c8d2534e").unwrap(),
            volume_id: volume_id.map(str::to_string),
            last_state: "same_az",
            reason_code: "attachment_failed",
            error: "AttachVolume rejected".to_string(),
        }
    }

    #[test]
    fn test_message_names_instance_and_volume() {
        let message = report(Some("vol-049df61146c4d7901")).message();
        assert!(message.contains("instanceId: i-06fc91a93c8d2534e"));
        assert!(message.contains("volumeId: vol-049df61146c4d7901"));
        assert!(message.contains("last state: same_az"));
        assert!(message.contains("reason: attachment_failed"));
    }

    #[test]
    fn test_message_degrades_to_unknown_volume() {
        let message = report(None).message();
        assert!(message.contains("volumeId: unknown volume"));
    }

    #[tokio::test]
    async fn test_notifier_publishes_to_topic() {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::new(sink.clone(), "support-topic");

        notifier.notify_failure(&report(None)).await;

        let published = sink.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "support-topic");
    }

    #[tokio::test]
    async fn test_notifier_swallows_delivery_failure() {
        let notifier = Notifier::new(Arc::new(MemorySink::failing("down")), "support-topic");
        // Completes without panicking or returning an error.
        notifier.notify_failure(&report(None)).await;
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/support"))
            .and(body_partial_json(serde_json::json!({
                "topic": "support-topic",
                "message": "volume lost",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/hooks/support", server.uri())).unwrap();
        sink.publish("support-topic", "volume lost").await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_sink_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri()).unwrap();
        let err = sink.publish("support-topic", "volume lost").await.unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Rejected { status: 503, ref body } if body == "maintenance"
        ));
    }
}
