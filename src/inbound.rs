//! The per-transaction message handler: recipient policy, message parsing
//! and the synchronous forward to the downstream endpoint.

use crate::error::Rejection;
use crate::forward::Forwarder;
use crate::message::{IncomingEmailPayload, collect_headers, extract_bodies, extract_subject};
use crate::smtp_server::{Envelope, SmtpHandler};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use mailparse::parse_mail;
use std::sync::Arc;

/// Accepts mail for a single domain and forwards every delivered message.
///
/// The handler itself is immutable and shared between connections; all
/// transaction state lives in the connection's [`Envelope`].
pub struct DomainFilterHandler {
    /// `"@" + accepted domain`, lower-cased once at construction.
    accepted_suffix: String,
    forwarder: Arc<dyn Forwarder>,
}

impl DomainFilterHandler {
    pub fn new(accepted_domain: &str, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            accepted_suffix: format!("@{}", accepted_domain.to_lowercase()),
            forwarder,
        }
    }

    /// Parse the delivered bytes into the forward payload.
    ///
    /// Only a malformed envelope is fatal here; bad individual MIME parts
    /// merely leave their body field empty.
    fn build_payload(&self, envelope: &Envelope) -> Result<IncomingEmailPayload, Rejection> {
        let raw_base64 = BASE64_STANDARD.encode(&envelope.data);

        let mail = parse_mail(&envelope.data).map_err(|e| {
            log::error!(
                "Failed to parse message - FROM: {}, ERROR: {}",
                envelope.mail_from,
                e
            );
            Rejection::processing_error()
        })?;

        let subject = extract_subject(&mail);
        log::info!("SMTP EMAIL SUBJECT: {}", subject);

        let headers = collect_headers(&mail);
        let bodies = extract_bodies(&mail);
        log::debug!(
            "SMTP EMAIL BODY - text length: {}, html length: {}",
            bodies.text.len(),
            bodies.html.len()
        );

        Ok(IncomingEmailPayload {
            mail_from: envelope.mail_from.clone(),
            rcpt_to: envelope.rcpt_to.clone(),
            subject,
            text_body: bodies.text,
            html_body: bodies.html,
            headers,
            raw_base64,
        })
    }
}

#[async_trait]
impl SmtpHandler for DomainFilterHandler {
    // Accept-all sender policy; sender reputation is a downstream concern.
    fn handle_mail(&self, address: &str) -> Result<(), Rejection> {
        log::info!("SMTP MAIL FROM: {}", address);
        Ok(())
    }

    fn handle_rcpt(&self, address: &str) -> Result<String, Rejection> {
        let normalized = address.trim().to_lowercase();
        log::info!("SMTP RCPT TO: {}", normalized);
        if !normalized.ends_with(&self.accepted_suffix) {
            log::warn!(
                "SMTP RCPT TO rejected - not ending with {}: {}",
                self.accepted_suffix,
                normalized
            );
            return Err(Rejection::relaying_denied());
        }
        Ok(normalized)
    }

    async fn handle_data(&self, envelope: &Envelope) -> Result<(), Rejection> {
        log::info!(
            "SMTP DATA received - FROM: {}, TO: {:?}",
            envelope.mail_from,
            envelope.rcpt_to
        );
        log::debug!("SMTP DATA size: {} bytes", envelope.data.len());

        let payload = self.build_payload(envelope)?;

        log::info!(
            "Forwarding email - FROM: {}, TO: {:?}, SUBJECT: {}",
            payload.mail_from,
            payload.rcpt_to,
            payload.subject
        );
        self.forwarder.forward(&payload).await.map_err(|e| {
            log::error!(
                "Failed to forward email - FROM: {}, TO: {:?}, ERROR: {}",
                payload.mail_from,
                payload.rcpt_to,
                e
            );
            Rejection::processing_error()
        })?;
        log::info!(
            "Email forwarded successfully - FROM: {}, TO: {:?}",
            payload.mail_from,
            payload.rcpt_to
        );
        Ok(())
    }
}
