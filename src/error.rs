//! Error types.

/// Startup error for mailhook.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// An SMTP-visible rejection, rendered on the wire as `<code> <message>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    /// Permanent policy failure: recipient outside the accepted domain.
    pub fn relaying_denied() -> Self {
        Self {
            code: 550,
            message: "Relaying denied".to_string(),
        }
    }

    /// Transient failure: the message could not be parsed or forwarded.
    /// The sending MTA is expected to retry.
    pub fn processing_error() -> Self {
        Self {
            code: 451,
            message: "Processing error".to_string(),
        }
    }
}
