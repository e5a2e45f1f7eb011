//! Outbound/inbound messaging adapters (C3). `BaseTransport` is the seam the
//! rest of the engine programs against; `SmsTransport` and
//! `WebhookChatTransport` are the two concrete channels spec §3's
//! `messaging_channel` column can name.

use async_trait::async_trait;

use crate::errors::TransportError;
use sms_transport::{SmsClient, SmsError};

#[async_trait]
pub trait BaseTransport: Send + Sync {
    /// Sends `body` to `recipient` (the tenant's `user_handle` resolved to a
    /// channel-specific address), returning a transport-assigned message id
    /// when the channel provides one.
    async fn send(&self, recipient: &str, body: &str) -> Result<Option<String>, TransportError>;
}

impl From<SmsError> for TransportError {
    fn from(err: SmsError) -> Self {
        match err {
            SmsError::Rejected { status, body } => {
                TransportError::Rejected(format!("{status}: {body}"))
            }
            SmsError::Request(e) => TransportError::Network(e.to_string()),
        }
    }
}

/// SMS channel, backed by the `sms-transport` crate's Twilio client.
pub struct SmsTransport {
    client: SmsClient,
}

impl SmsTransport {
    pub fn new(client: SmsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BaseTransport for SmsTransport {
    async fn send(&self, recipient: &str, body: &str) -> Result<Option<String>, TransportError> {
        let response = self.client.send(recipient, body).await?;
        Ok(Some(response.sid))
    }
}

/// Chat-style channel for tenants that talk to the engine over a plain HTTP
/// webhook rather than SMS (e.g. a Slack or Telegram bridge sitting in front
/// of the engine). Posts `{ "to": recipient, "body": body }` to a
/// per-tenant URL and does not expect a transport-assigned id back.
pub struct WebhookChatTransport {
    http: reqwest::Client,
    target_url: String,
}

impl WebhookChatTransport {
    pub fn new(target_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            target_url,
        }
    }
}

#[async_trait]
impl BaseTransport for WebhookChatTransport {
    async fn send(&self, recipient: &str, body: &str) -> Result<Option<String>, TransportError> {
        let response = self
            .http
            .post(&self.target_url)
            .json(&serde_json::json!({ "to": recipient, "body": body }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!("{status}: {body}")));
        }
        Ok(None)
    }
}

/// Fake transport for tests: records every send, never errors unless
/// configured to.
#[derive(Default)]
pub struct FakeTransport {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BaseTransport for FakeTransport {
    async fn send(&self, recipient: &str, body: &str) -> Result<Option<String>, TransportError> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(TransportError::Network("fake failure".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), body.to_string()));
        Ok(Some(format!("fake-{}", self.sent.lock().unwrap().len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_transport_records_sends() {
        let transport = FakeTransport::new();
        transport.send("+15551234567", "hi").await.unwrap();
        assert_eq!(transport.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn fake_transport_can_be_made_to_fail() {
        let transport = FakeTransport::new();
        transport.fail_next();
        assert!(transport.send("+15551234567", "hi").await.is_err());
        assert!(transport.send("+15551234567", "hi").await.is_ok());
    }
}
