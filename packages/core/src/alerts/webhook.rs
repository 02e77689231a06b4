//! Chat webhook alert delivery.
//!
//! Posts a Slack-compatible incoming-webhook payload: a one-line summary plus
//! an attachment carrying the message and one field per structured data key.
//! The receiver acknowledges with `200 ok`; anything else is a failed
//! delivery.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{Alert, AlertChannel, AlertError};

/// Incoming-webhook channel.
#[derive(Clone)]
pub struct SlackWebhookChannel {
    webhook_url: String,
    http: Client,
}

impl SlackWebhookChannel {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: Client::new(),
        }
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }
}

/// Render the webhook body for an alert.
pub fn build_payload(alert: &Alert) -> Value {
    let fields: Vec<Value> = alert
        .data
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Object(_) | Value::Array(_) => {
                    serde_json::to_string_pretty(value).unwrap_or_default()
                }
                other => other.to_string(),
            };
            json!({ "title": key, "value": rendered, "short": false })
        })
        .collect();

    json!({
        "text": format!("*{}*: {}", alert.severity, alert.title),
        "attachments": [{
            "color": alert.severity.color(),
            "title": alert.title,
            "text": alert.message,
            "fields": fields,
            "footer": format!(
                "NBA Stat Projections | {}",
                alert.timestamp.format("%Y-%m-%d %H:%M:%S")
            ),
        }]
    })
}

#[async_trait]
impl AlertChannel for SlackWebhookChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        if self.webhook_url.is_empty() {
            return Err(AlertError::not_configured("Slack webhook URL is empty"));
        }

        let response = self
            .http
            .post(&self.webhook_url)
            .json(&build_payload(alert))
            .send()
            .await
            .map_err(|err| AlertError::transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AlertError::transport(err.to_string()))?;

        if status.as_u16() == 200 && body.trim() == "ok" {
            Ok(())
        } else {
            Err(AlertError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertData, Severity};
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn make_alert() -> Alert {
        let mut data = AlertData::new();
        data.insert("job_id".to_string(), Value::from("daily_update"));
        data.insert("duration_seconds".to_string(), Value::from("2.50"));
        Alert::new("Scheduled Job Failed: daily_update", "boom", Severity::Error, data)
    }

    #[test]
    fn payload_has_one_field_per_data_key() {
        let payload = build_payload(&make_alert());

        assert_eq!(payload["text"], "*ERROR*: Scheduled Job Failed: daily_update");
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        // BTreeMap ordering: duration_seconds before job_id
        assert_eq!(fields[0]["title"], "duration_seconds");
        assert_eq!(fields[1]["value"], "daily_update");
        assert_eq!(payload["attachments"][0]["color"], "#DC3545");
    }

    #[tokio::test]
    async fn deliver_succeeds_on_ok_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(
                json!({ "text": "*ERROR*: Scheduled Job Failed: daily_update" }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let channel = SlackWebhookChannel::new(format!("{}/hook", server.uri()));
        assert!(channel.deliver(&make_alert()).await.is_ok());
    }

    #[tokio::test]
    async fn deliver_fails_on_non_ok_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("invalid_payload"))
            .mount(&server)
            .await;

        let channel = SlackWebhookChannel::new(server.uri());
        let err = channel.deliver(&make_alert()).await.unwrap_err();
        assert!(matches!(err, AlertError::Rejected { status: 200, .. }));
    }

    #[tokio::test]
    async fn deliver_fails_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let channel = SlackWebhookChannel::new(server.uri());
        let err = channel.deliver(&make_alert()).await.unwrap_err();
        assert!(matches!(err, AlertError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn empty_url_is_not_configured() {
        let channel = SlackWebhookChannel::new(String::new());
        let err = channel.deliver(&make_alert()).await.unwrap_err();
        assert!(matches!(err, AlertError::NotConfigured { .. }));
    }
}
