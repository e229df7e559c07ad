//! Alert delivery channels.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::TrafficError;

/// Everything a channel needs to render one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub request_id: String,
    pub risk_score: u8,
    pub src_ip: String,
    pub provider: String,
    pub model: String,
    /// Matched rule names, in evaluation order.
    pub reasons: Vec<String>,
    pub prompt_preview: String,
    pub timestamp: DateTime<Utc>,
    /// Deep link to the request in the dashboard.
    pub dashboard_url: String,
}

/// Delivers alerts to an outside channel.
///
/// Implementations must not retry; the dispatcher records whatever
/// `notify` returns as the final outcome.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, message: &AlertMessage)
    -> impl Future<Output = Result<(), TrafficError>> + Send;

    /// `alerts.alert_type` column value.
    fn channel(&self) -> &str;

    /// `alerts.recipient` column value.
    fn recipient(&self) -> &str;
}

impl<N: Notifier> Notifier for std::sync::Arc<N> {
    fn notify(
        &self,
        message: &AlertMessage,
    ) -> impl Future<Output = Result<(), TrafficError>> + Send {
        (**self).notify(message)
    }

    fn channel(&self) -> &str {
        (**self).channel()
    }

    fn recipient(&self) -> &str {
        (**self).recipient()
    }
}

/// Posts Slack-compatible messages to an incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TrafficError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Slack attachment body for `message`.
    pub fn build_payload(message: &AlertMessage) -> Value {
        let triggered = if message.reasons.is_empty() {
            "Unknown".to_owned()
        } else {
            message.reasons.join(", ")
        };

        json!({
            "text": format!(
                "Shadow AI Alert: High-risk LLM request detected (Risk Score: {})",
                message.risk_score
            ),
            "attachments": [{
                "color": risk_color(message.risk_score),
                "blocks": [
                    {
                        "type": "header",
                        "text": {
                            "type": "plain_text",
                            "text": "Shadow AI Security Alert",
                            "emoji": true
                        }
                    },
                    {
                        "type": "section",
                        "fields": [
                            {"type": "mrkdwn", "text": format!("*Risk Score:* {}/100", message.risk_score)},
                            {"type": "mrkdwn", "text": format!("*Source IP:* {}", message.src_ip)},
                            {"type": "mrkdwn", "text": format!("*Provider:* {}", message.provider)},
                            {"type": "mrkdwn", "text": format!("*Model:* {}", message.model)}
                        ]
                    },
                    {
                        "type": "section",
                        "text": {"type": "mrkdwn", "text": format!("*Triggered Rules:* {triggered}")}
                    },
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Prompt Preview:*\n```{}```", message.prompt_preview)
                        }
                    },
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!(
                                "*Timestamp:* {}",
                                message.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
                            )
                        }
                    },
                    {
                        "type": "actions",
                        "elements": [{
                            "type": "button",
                            "text": {"type": "plain_text", "text": "View Details", "emoji": true},
                            "url": message.dashboard_url,
                            "style": "primary"
                        }]
                    }
                ]
            }]
        })
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &AlertMessage) -> Result<(), TrafficError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::build_payload(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrafficError::Notify(format!(
                "webhook returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }

    fn channel(&self) -> &str {
        "slack"
    }

    fn recipient(&self) -> &str {
        "slack_webhook"
    }
}

/// Attachment colour band for a risk score.
pub fn risk_color(score: u8) -> &'static str {
    match score {
        80.. => "danger",
        60..=79 => "warning",
        40..=59 => "#ffcc00",
        _ => "good",
    }
}

/// `{base}/requests/{request_id}`, tolerating a trailing slash on `base`.
pub fn dashboard_link(base: &str, request_id: &str) -> String {
    format!("{}/requests/{request_id}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> AlertMessage {
        AlertMessage {
            request_id: "req-9".to_owned(),
            risk_score: 85,
            src_ip: "10.0.0.7".to_owned(),
            provider: "openai".to_owned(),
            model: "gpt-4".to_owned(),
            reasons: vec!["Critical Keywords".to_owned(), "Email Pattern".to_owned()],
            prompt_preview: "my password is...".to_owned(),
            timestamp: DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            dashboard_url: dashboard_link("http://dash:3000/", "req-9"),
        }
    }

    #[test]
    fn color_bands() {
        assert_eq!(risk_color(100), "danger");
        assert_eq!(risk_color(80), "danger");
        assert_eq!(risk_color(79), "warning");
        assert_eq!(risk_color(60), "warning");
        assert_eq!(risk_color(59), "#ffcc00");
        assert_eq!(risk_color(40), "#ffcc00");
        assert_eq!(risk_color(39), "good");
        assert_eq!(risk_color(0), "good");
    }

    #[test]
    fn dashboard_link_trims_trailing_slash() {
        assert_eq!(dashboard_link("http://d/", "r1"), "http://d/requests/r1");
        assert_eq!(dashboard_link("http://d", "r1"), "http://d/requests/r1");
    }

    #[test]
    fn payload_carries_alert_fields() {
        let payload = WebhookNotifier::build_payload(&message());
        let text = payload["text"].as_str().unwrap();
        assert!(text.contains("Risk Score: 85"));

        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "danger");

        let rendered = payload.to_string();
        assert!(rendered.contains("*Source IP:* 10.0.0.7"));
        assert!(rendered.contains("*Model:* gpt-4"));
        assert!(rendered.contains("Critical Keywords, Email Pattern"));
        assert!(rendered.contains("my password is..."));
        assert!(rendered.contains("2024-01-15 12:00:00 UTC"));

        let button = &attachment["blocks"][5]["elements"][0];
        assert_eq!(button["url"], "http://dash:3000/requests/req-9");
    }

    #[test]
    fn payload_without_reasons_says_unknown() {
        let mut msg = message();
        msg.reasons.clear();
        let rendered = WebhookNotifier::build_payload(&msg).to_string();
        assert!(rendered.contains("*Triggered Rules:* Unknown"));
    }

    #[tokio::test]
    async fn unreachable_webhook_is_an_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(500)).unwrap();
        assert_eq!(notifier.channel(), "slack");
        assert!(notifier.notify(&message()).await.is_err());
    }
}
