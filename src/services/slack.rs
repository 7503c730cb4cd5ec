//! Slack alerting via an incoming webhook.

use std::sync::Arc;

use crate::errors::ControllerError;

/// Posts error alerts to a Slack incoming webhook.
///
/// Posting is fire-and-forget: alerts are sent from a spawned task so that
/// alerting never blocks or fails the operation being reported.
#[derive(Clone)]
pub struct SlackWebhookClient {
    http: reqwest::Client,
    webhook: Option<Arc<String>>,
}

impl SlackWebhookClient {
    pub fn new(http: reqwest::Client, webhook: Option<String>) -> Self {
        SlackWebhookClient {
            http,
            webhook: webhook.map(Arc::new),
        }
    }

    /// Report a controller error, prefixing the summary with the
    /// application name.
    pub fn post_error(&self, error: &ControllerError) {
        let summary = format!("Error in Nublado: {}", error.slack_summary());
        let blocks = error.to_slack_blocks(Some(&summary));
        self.post(blocks);
    }

    /// Post raw Block Kit blocks without blocking the caller.
    pub fn post(&self, blocks: serde_json::Value) {
        let Some(webhook) = self.webhook.clone() else {
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http.post(webhook.as_str()).json(&blocks).send().await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    warn!("Slack webhook returned status {}", response.status().as_u16());
                }
                Ok(_) => (),
                Err(error) => warn!("Error posting to Slack webhook: {error}"),
            }
        });
    }
}
