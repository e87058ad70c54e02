//! Notification delivery backends.

use std::sync::Arc;

use async_trait::async_trait;
use neurochron_config::{NotifierBackend, NotifierConfig};
use neurochron_core::collaborator::{DeliveryError, Notification, Notifier};
use serde::Serialize;
use tracing::{info, warn};

/// Build the notifier selected by `config`.
pub fn build_notifier(config: &NotifierConfig) -> Arc<dyn Notifier> {
    match config.backend {
        NotifierBackend::Log => Arc::new(LogNotifier),
        NotifierBackend::SendGrid => Arc::new(SendGridNotifier::new(config)),
    }
}

/// Writes notices to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, contact: &str, notification: &Notification) -> Result<(), DeliveryError> {
        info!(
            job_id = %notification.job_id(),
            contact,
            subject = %notification.subject(),
            "Notification"
        );
        Ok(())
    }
}

/// Delivers notices as plain-text email through the SendGrid v3 API.
pub struct SendGridNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
    from_name: String,
    reply_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct MailSend<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address<'a>>,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    kind: &'static str,
    value: String,
}

impl SendGridNotifier {
    pub fn new(config: &NotifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
            from_name: config.from_name.clone(),
            reply_to: config.reply_to.clone(),
        }
    }

    fn message<'a>(&'a self, contact: &'a str, notification: &Notification) -> MailSend<'a> {
        MailSend {
            personalizations: vec![Personalization {
                to: vec![Address {
                    email: contact,
                    name: None,
                }],
            }],
            from: Address {
                email: &self.from,
                name: Some(&self.from_name),
            },
            reply_to: self.reply_to.as_deref().map(|email| Address { email, name: None }),
            subject: notification.subject(),
            content: vec![Content {
                kind: "text/plain",
                value: notification.body(),
            }],
        }
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, contact: &str, notification: &Notification) -> Result<(), DeliveryError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(DeliveryError::permanent("no API key configured"));
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&self.message(contact, notification))
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            info!(job_id = %notification.job_id(), "Notification delivered");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        warn!(job_id = %notification.job_id(), %status, "Notification rejected");
        let message = format!("mail API returned {status}: {text}");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(DeliveryError::transient(message))
        } else {
            Err(DeliveryError::permanent(message))
        }
    }
}
