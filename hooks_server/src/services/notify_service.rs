//! Build notifications — posts human readable summaries to Slack.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::build_event::{format_duration, BuildEvent};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification rejected: {status} {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A build for `repository` has begun.
    async fn build_started(&self, repository: &str) -> Result<(), NotifyError>;

    /// A build reached its terminal status.
    async fn build_finished(&self, event: &BuildEvent) -> Result<(), NotifyError>;
}

/// Used when no notification endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn build_started(&self, _repository: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn build_finished(&self, _event: &BuildEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SlackMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SlackAttachment {
    pub color: &'static str,
    pub fields: Vec<SlackField>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SlackField {
    pub title: &'static str,
    pub value: String,
    pub short: bool,
}

impl SlackMessage {
    pub fn started(repository: &str) -> Self {
        Self {
            text: format!("Build of {repository} is started"),
            attachments: Vec::new(),
        }
    }

    pub fn finished(event: &BuildEvent) -> Self {
        let color = if event.succeeded { "good" } else { "danger" };
        let field = |title, value| SlackField {
            title,
            value,
            short: false,
        };

        Self {
            text: format!("Build of {} is {}", event.repository, event.status),
            attachments: vec![SlackAttachment {
                color,
                fields: vec![
                    field("Repository", event.repository.clone()),
                    field("Duration", format_duration(event.duration())),
                    field("Date", event.date()),
                ],
            }],
        }
    }
}

const SLACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack incoming-webhook notifier.
pub struct SlackNotifier {
    url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = match reqwest::Client::builder().timeout(SLACK_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Slack client without timeout: {e}");
                reqwest::Client::new()
            }
        };
        Self {
            url: url.into(),
            client,
        }
    }

    /// Webhook for `company` authenticated with `token`.
    pub fn for_company(company: &str, token: &str) -> Self {
        Self::new(format!(
            "https://{company}.slack.com/services/hooks/incoming-webhook?token={token}"
        ))
    }

    async fn post(&self, message: &SlackMessage) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .header("User-Agent", "cyhooks")
            .json(message)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn build_started(&self, repository: &str) -> Result<(), NotifyError> {
        self.post(&SlackMessage::started(repository)).await
    }

    async fn build_finished(&self, event: &BuildEvent) -> Result<(), NotifyError> {
        self.post(&SlackMessage::finished(event)).await
    }
}
