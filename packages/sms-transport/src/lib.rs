//! Minimal client for sending outbound text messages through Twilio's
//! Messages API. Used by `engine_core`'s `MessageTransport` adapters as the
//! concrete "chat platform A" implementation.

use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("twilio returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("request to twilio failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct SmsOptions {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub struct SmsClient {
    options: SmsOptions,
    http: Client,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageResponse {
    pub sid: String,
    pub status: String,
}

impl SmsClient {
    pub fn new(options: SmsOptions) -> Self {
        Self {
            options,
            http: Client::new(),
        }
    }

    /// Send `body` to `to` (E.164 phone number). Returns the provider's
    /// message SID, used as the transport_message_id.
    pub async fn send(&self, to: &str, body: &str) -> Result<SendMessageResponse, SmsError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.options.account_sid
        );

        let mut form_body: HashMap<&str, &str> = HashMap::new();
        form_body.insert("To", to);
        form_body.insert("From", &self.options.from_number);
        form_body.insert("Body", body);

        let response = self
            .http
            .post(url)
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SmsError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<SendMessageResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_clone_independently() {
        let opts = SmsOptions {
            account_sid: "AC1".into(),
            auth_token: "secret".into(),
            from_number: "+15550000000".into(),
        };
        let client = SmsClient::new(opts.clone());
        assert_eq!(client.options.account_sid, opts.account_sid);
    }
}
