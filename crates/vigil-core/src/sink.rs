//! Notification sink implementations.
//!
//! The core ships one real transport: an HTTP webhook POST. The rule's
//! destination is the webhook URL; the payload carries the task
//! identity, the formatted elapsed time, and the deep link. Email or
//! chat delivery are just different sinks behind the same trait.

use std::time::Duration;

use serde_json::json;
use url::Url;

use crate::error::SinkError;
use crate::evaluator::{Notification, NotificationSink};

/// Bounded per-request timeout for webhook deliveries.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers notifications by POSTing JSON to the destination URL.
pub struct WebhookSink {
    client: reqwest::blocking::Client,
}

impl WebhookSink {
    pub fn new() -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(SinkError::from)?;
        Ok(Self { client })
    }
}

impl NotificationSink for WebhookSink {
    fn send(&self, notification: &Notification) -> Result<(), SinkError> {
        let url = Url::parse(&notification.destination).map_err(|e| {
            SinkError::InvalidDestination {
                destination: notification.destination.clone(),
                message: e.to_string(),
            }
        })?;

        let body = json!({
            "task_id": notification.task_id,
            "task_name": notification.task_name,
            "elapsed_secs": notification.elapsed_secs,
            "elapsed": notification.elapsed_human,
            "deep_link": notification.deep_link,
            "message": format!(
                "Task \"{}\" has spent {} in progress and exceeded its configured limit.",
                notification.task_name, notification.elapsed_human
            ),
        });

        let resp = self.client.post(url).json(&body).send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(SinkError::DeliveryFailed(format!(
                "webhook returned HTTP {status}"
            )));
        }
        Ok(())
    }
}
