//! Parsing a delivered message into the payload forwarded downstream.

use mailparse::{MailHeaderMap, ParsedMail};

/// Nesting bound for the body walk. Messages nested deeper than this are
/// cut off rather than recursed into.
const MAX_MIME_DEPTH: usize = 32;

/// Everything extracted from one delivered message, together with the
/// envelope it arrived with. Built once per DATA command, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingEmailPayload {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    /// Header names in order of first occurrence, each with its values in
    /// arrival order. Duplicate header names are preserved.
    pub headers: Vec<(String, Vec<String>)>,
    pub raw_base64: String,
}

/// Best-effort plain-text and HTML bodies of a message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BodyParts {
    pub text: String,
    pub html: String,
}

/// Decoded Subject header, empty if absent.
pub fn extract_subject(mail: &ParsedMail) -> String {
    mail.headers.get_first_value("Subject").unwrap_or_default()
}

/// Collect all top-level headers, preserving duplicates and order.
///
/// Values are grouped under the first occurrence of their name, so
/// distinct names keep their original relative order.
pub fn collect_headers(mail: &ParsedMail) -> Vec<(String, Vec<String>)> {
    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for header in &mail.headers {
        let key = header.get_key();
        let value = header.get_value();
        match headers.iter_mut().find(|(name, _)| *name == key) {
            Some((_, values)) => values.push(value),
            None => headers.push((key, vec![value])),
        }
    }
    headers
}

/// Walk the MIME tree and pick the first non-empty `text/plain` and
/// `text/html` bodies in pre-order.
///
/// A part that fails to decode contributes nothing and the walk continues
/// with its siblings. Note that in a `multipart/alternative` this keeps the
/// *first* listed part, not the conventionally preferred last one.
pub fn extract_bodies(mail: &ParsedMail) -> BodyParts {
    let mut found = BodyParts::default();
    walk_part(mail, 0, &mut found);
    found
}

fn walk_part(part: &ParsedMail, depth: usize, found: &mut BodyParts) {
    if depth > MAX_MIME_DEPTH {
        log::warn!(
            "MIME tree deeper than {} levels, ignoring nested parts",
            MAX_MIME_DEPTH
        );
        return;
    }

    let mimetype = &part.ctype.mimetype;
    if mimetype.eq_ignore_ascii_case("text/plain") {
        if found.text.is_empty() {
            match part.get_body() {
                Ok(body) => found.text = body,
                Err(e) => log::warn!("Failed to decode text/plain part: {}", e),
            }
        }
    } else if mimetype.eq_ignore_ascii_case("text/html") {
        if found.html.is_empty() {
            match part.get_body() {
                Ok(body) => found.html = body,
                Err(e) => log::warn!("Failed to decode text/html part: {}", e),
            }
        }
    } else if mimetype.starts_with("multipart/") {
        // mailparse lowercases the mimetype, so a plain prefix match is enough.
        for subpart in &part.subparts {
            walk_part(subpart, depth + 1, found);
        }
    }
    // Attachments and unknown types contribute nothing.
}
