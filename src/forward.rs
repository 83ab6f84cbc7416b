//! Delivery of a parsed message to the downstream HTTP endpoint.

use crate::config::ForwardConfig;
use crate::message::IncomingEmailPayload;
use async_trait::async_trait;
use std::time::Duration;

/// Failure of one forward attempt. There is no retry: the caller turns
/// this into a transient SMTP rejection and drops the message.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forward request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forward endpoint returned status {0}")]
    Status(reqwest::StatusCode),
}

/// The outbound boundary, as a trait so handlers can be tested without
/// a live endpoint.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, payload: &IncomingEmailPayload) -> Result<(), ForwardError>;
}

/// Forwards payloads with a single form-encoded POST per message.
#[derive(Debug, Clone)]
pub struct ForwardClient {
    client: reqwest::Client,
    config: ForwardConfig,
}

impl ForwardClient {
    pub fn new(config: ForwardConfig) -> Result<Self, crate::error::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }
}

/// Flatten collected headers into `"Name: v1, v2"` lines.
pub fn flatten_headers(headers: &[(String, Vec<String>)]) -> String {
    headers
        .iter()
        .map(|(name, values)| format!("{}: {}", name, values.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The API-key header to attach, if any. Both the name and the key must be
/// configured and non-blank, otherwise the request goes out without one.
fn auth_header(config: &ForwardConfig) -> Option<(&str, &str)> {
    let name = config.auth_header_name.as_deref()?;
    let key = config.api_key.as_deref()?;
    if name.trim().is_empty() || key.trim().is_empty() {
        return None;
    }
    Some((name, key))
}

/// Build the form fields for one payload.
///
/// Only the first accepted recipient is sent as `to`; the downstream
/// endpoint takes a single recipient parameter.
fn build_form(payload: &IncomingEmailPayload, include_raw: bool) -> Vec<(&'static str, String)> {
    let to = payload.rcpt_to.first().cloned().unwrap_or_default();

    let mut form = vec![
        ("to", to),
        ("from", payload.mail_from.clone()),
        ("subject", payload.subject.clone()),
    ];
    if !payload.text_body.is_empty() {
        form.push(("text", payload.text_body.clone()));
    }
    if !payload.html_body.is_empty() {
        form.push(("html", payload.html_body.clone()));
    }
    let headers = flatten_headers(&payload.headers);
    if !headers.is_empty() {
        form.push(("headers", headers));
    }
    if include_raw {
        form.push(("raw", payload.raw_base64.clone()));
    }
    form
}

#[async_trait]
impl Forwarder for ForwardClient {
    async fn forward(&self, payload: &IncomingEmailPayload) -> Result<(), ForwardError> {
        let form = build_form(payload, self.config.include_raw);
        log::info!(
            "HTTP POST request - URL: {}, FROM: {}, TO: {:?}, SUBJECT: {}",
            self.config.url,
            payload.mail_from,
            payload.rcpt_to.first(),
            payload.subject
        );
        log::debug!(
            "HTTP POST request payload size - headers: {}, text: {}, html: {}, raw: {}",
            payload.headers.len(),
            payload.text_body.len(),
            payload.html_body.len(),
            payload.raw_base64.len()
        );

        let mut request = self.client.post(&self.config.url).form(&form);
        if let Some((name, key)) = auth_header(&self.config) {
            request = request.header(name, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status));
        }
        log::info!(
            "HTTP POST response - Status: {}, FROM: {}",
            status,
            payload.mail_from
        );
        Ok(())
    }
}
