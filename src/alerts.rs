// Alert sink - forwards operational events to Slack
//
// Runs as its own task consuming the event channel until it closes.
// Delivery failures are logged and absorbed; alerting must never be able
// to take the router down. Without a configured webhook the sink still
// drains the channel so senders never block on a dead receiver.

use anyhow::Result;
use tokio::sync::mpsc;

use crate::events::RouterEvent;

pub struct AlertSink {
    webhook_url: Option<String>,
    client: reqwest::Client,
    event_rx: mpsc::Receiver<RouterEvent>,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>, event_rx: mpsc::Receiver<RouterEvent>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            webhook_url,
            client,
            event_rx,
        })
    }

    /// Run the sink loop until the channel closes
    pub async fn run(mut self) {
        match self.webhook_url {
            Some(_) => tracing::info!("Alert sink started (Slack webhook configured)"),
            None => tracing::debug!("Alert sink started without webhook; events are logged only"),
        }

        while let Some(event) = self.event_rx.recv().await {
            tracing::info!("Alert: {}", event.summary());
            if let Some(url) = self.webhook_url.as_deref() {
                if let Err(e) = self.post(url, &event).await {
                    tracing::warn!("Slack delivery failed: {e}");
                }
            }
        }

        tracing::info!("Alert sink shutting down");
    }

    async fn post(&self, url: &str, event: &RouterEvent) -> Result<(), reqwest::Error> {
        let payload = serde_json::json!({
            "text": format!(":rotating_light: vecgate: {}", event.summary()),
            "event": event,
        });
        self.client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
