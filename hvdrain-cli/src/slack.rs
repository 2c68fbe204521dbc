use anyhow::{Context, Result};
use async_trait::async_trait;
use libhvdrain::config::SlackConfig;
use libhvdrain::notify::{Notifier, Severity};
use serde::Serialize;

/// Posts run notifications to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: config.webhook_url().clone(),
            channel: config.channel().clone(),
        }
    }

    fn message<'a>(&'a self, message: &str, severity: Severity, channel: Option<&'a str>) -> SlackMessage<'a> {
        let prefix = match severity {
            Severity::Info => ":information_source:",
            Severity::Warning => ":warning:",
            Severity::Critical => ":rotating_light:",
        };
        SlackMessage {
            text: format!("{} {}", prefix, message),
            channel: channel.or(self.channel.as_deref()),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str, severity: Severity, channel: Option<&str>) -> Result<()> {
        self.http
            .post(&self.webhook_url)
            .json(&self.message(message, severity, channel))
            .send()
            .await
            .context("posting to slack")?
            .error_for_status()
            .context("slack rejected the message")?;
        Ok(())
    }
}
