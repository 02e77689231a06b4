//! SMTP mail alert delivery.
//!
//! Sends an HTML mail with the alert header, message, and a key/value table
//! of the structured payload. When a username and password are configured
//! the connection is upgraded with STARTTLS and authenticated; otherwise the
//! relay is used as-is.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value;

use super::{Alert, AlertChannel, AlertError};

/// Connection settings for the mail relay.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub recipient: String,
}

/// Mail channel bound to a single recipient.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipient: Mailbox,
}

impl EmailChannel {
    pub fn new(settings: &SmtpSettings) -> Result<Self, AlertError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|err| AlertError::not_configured(format!("SMTP_FROM_EMAIL: {}", err)))?;
        let recipient: Mailbox = settings
            .recipient
            .parse()
            .map_err(|err| AlertError::not_configured(format!("ALERT_EMAIL: {}", err)))?;

        let builder = match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
                    .map_err(|err| AlertError::not_configured(err.to_string()))?
                    .credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.server),
        };

        Ok(Self {
            transport: builder.port(settings.port).build(),
            from,
            recipient,
        })
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.recipient.clone())
            .subject(format!("[{}] {}", alert.severity, alert.title))
            .header(ContentType::TEXT_HTML)
            .body(format_email_body(alert))
            .map_err(|err| AlertError::transport(err.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|err| AlertError::transport(err.to_string()))?;

        Ok(())
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the HTML body of an alert mail.
pub fn format_email_body(alert: &Alert) -> String {
    let mut html = format!(
        "<html><body>\
         <div style=\"padding:10px;background-color:{color};color:white\">\
         <h2>{title}</h2><p>Level: {level}</p><p>Time: {time}</p></div>\
         <div style=\"padding:20px\"><p>{message}</p>",
        color = alert.severity.color(),
        title = escape_html(&alert.title),
        level = alert.severity,
        time = alert.timestamp.to_rfc3339(),
        message = escape_html(&alert.message),
    );

    if !alert.data.is_empty() {
        html.push_str("<h3>Additional Data</h3><table><tr><th>Key</th><th>Value</th></tr>");
        for (key, value) in &alert.data {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            };
            html.push_str(&format!(
                "<tr><td>{}</td><td><pre>{}</pre></td></tr>",
                escape_html(key),
                escape_html(&rendered)
            ));
        }
        html.push_str("</table>");
    }

    html.push_str(
        "</div><div style=\"font-size:12px\">\
         <p>This is an automated alert from the NBA Stat Projections system.</p>\
         </div></body></html>",
    );
    html
}
