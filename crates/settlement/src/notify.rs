use async_trait::async_trait;
use marketplace_domain::{ClientId, ProviderId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Push/in-app notification port. Delivery is best effort everywhere:
/// money-affecting writes never roll back because a notification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    Client(ClientId),
    Provider(ProviderId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
    pub data: Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, target: NotifyTarget, notice: Notice) -> Result<(), String>;
}

pub(crate) async fn send_best_effort(
    sink: Option<&dyn NotificationSink>,
    target: NotifyTarget,
    notice: Notice,
) {
    let Some(sink) = sink else {
        return;
    };
    if let Err(err) = sink.notify(target, notice).await {
        warn!(error = %err, "notification delivery failed, continuing");
    }
}

#[derive(Debug, Default)]
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify(&self, _target: NotifyTarget, _notice: Notice) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryNotificationSink {
    sent: Arc<Mutex<Vec<(NotifyTarget, Notice)>>>,
}

impl InMemoryNotificationSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_snapshot(&self) -> Vec<(NotifyTarget, Notice)> {
        self.sent
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, target: NotifyTarget, notice: Notice) -> Result<(), String> {
        self.sent
            .lock()
            .map_err(|_| "notification lock poisoned".to_string())?
            .push((target, notice));
        Ok(())
    }
}

/// Forwards notices to the push-notification service over HTTP. Any non-2xx
/// or transport failure is surfaced as a string for the caller to swallow.
#[derive(Debug, Clone)]
pub struct HttpNotificationSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpNotificationSink {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify(&self, target: NotifyTarget, notice: Notice) -> Result<(), String> {
        let body = serde_json::json!({
            "target": target,
            "title": notice.title,
            "body": notice.body,
            "data": notice.data,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("push service returned {}", response.status()));
        }
        Ok(())
    }
}
