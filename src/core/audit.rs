//! Audit notifications for block and unblock transitions.
//!
//! The shield never persists audit records itself. It hands each event to an
//! [`AuditSink`]; sinks that talk to the network deliver on a spawned task so
//! the request path never waits on them.

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while delivering audit events
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Webhook error: {0}")]
    WebhookError(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Transition being reported
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Blocked,
    Unblocked,
}

/// Audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub client_id: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    pub fn blocked(client_id: &str, reason: &str, now_ms: u64, expires_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: millis_to_datetime(now_ms),
            action: AuditAction::Blocked,
            client_id: client_id.to_string(),
            reason: Some(reason.to_string()),
            expires_at: Some(millis_to_datetime(expires_at_ms)),
        }
    }

    pub fn unblocked(client_id: &str, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: millis_to_datetime(now_ms),
            action: AuditAction::Unblocked,
            client_id: client_id.to_string(),
            reason: None,
            expires_at: None,
        }
    }
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Receiver of block/unblock transitions.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the application log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        match event.action {
            AuditAction::Blocked => info!(
                "audit: blocked {} ({}) until {}",
                event.client_id,
                event.reason.as_deref().unwrap_or("unspecified"),
                event
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            ),
            AuditAction::Unblocked => info!("audit: unblocked {}", event.client_id),
        }
    }
}

/// Appends events to a capped Redis list on a shared store.
pub struct RedisAuditSink {
    client: RedisClient,
    key: String,
    max_entries: usize,
}

impl RedisAuditSink {
    pub fn new(client: RedisClient, key: String, max_entries: usize) -> Self {
        Self {
            client,
            key,
            max_entries: max_entries.max(1),
        }
    }

    async fn deliver(
        client: RedisClient,
        key: String,
        max_entries: usize,
        event: AuditEvent,
    ) -> Result<(), AuditError> {
        let event_json = serde_json::to_string(&event)?;
        let mut conn = client.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .rpush(&key, event_json)
            .ignore()
            .ltrim(&key, -(max_entries as isize), -1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

impl AuditSink for RedisAuditSink {
    fn record(&self, event: AuditEvent) {
        let client = self.client.clone();
        let key = self.key.clone();
        let max_entries = self.max_entries;
        spawn_delivery(async move { Self::deliver(client, key, max_entries, event).await });
    }
}

/// Posts events as JSON to an HTTP endpoint.
pub struct WebhookAuditSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAuditSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn deliver(client: reqwest::Client, url: String, event: AuditEvent) -> Result<(), AuditError> {
        client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl AuditSink for WebhookAuditSink {
    fn record(&self, event: AuditEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        spawn_delivery(async move { Self::deliver(client, url, event).await });
    }
}

fn spawn_delivery<F>(delivery: F)
where
    F: std::future::Future<Output = Result<(), AuditError>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = delivery.await {
                    warn!("Audit delivery failed: {}", e);
                }
            });
        }
        Err(_) => warn!("Audit event dropped: no async runtime available"),
    }
}
