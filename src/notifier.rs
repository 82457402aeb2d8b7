use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::repositories::models::payment::{Currency, Payment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Completed,
    Expired,
}

/// Body of every webhook POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub status: WebhookEvent,
    pub address: String,
    pub currency: Currency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    pub timestamp: String,
}

impl WebhookPayload {
    pub fn new(payment: &Payment, event: WebhookEvent, at: DateTime<Utc>) -> Self {
        let (tx_hash, confirmations) = match event {
            WebhookEvent::Completed => (payment.tx_hash.clone(), payment.confirmations),
            WebhookEvent::Expired => (None, None),
        };

        Self {
            status: event,
            address: payment.address.clone(),
            currency: payment.currency,
            tx_hash,
            confirmations,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// One delivery attempt. Never fails outward; payments without a webhook
    /// URL are skipped.
    async fn notify(&self, payment: &Payment, event: WebhookEvent);
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, payment: &Payment, event: WebhookEvent) {
        let url = match &payment.webhook_url {
            Some(url) => url,
            None => return,
        };
        let payload = WebhookPayload::new(payment, event, Utc::now());

        let res = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match res {
            Ok(resp) => debug!(
                "Webhook {:?} delivered for {} ({})",
                event,
                payment.address,
                resp.status()
            ),
            Err(e) => warn!("Webhook delivery failed for {}: {}", payment.address, e),
        }
    }
}
