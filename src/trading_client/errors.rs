use serde::Deserialize;

/// Result type used by [`RestClient`](super::RestClient) and the order flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the trading backend client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request never produced an HTTP response (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),
    /// Configuration validation failure raised by a builder.
    #[error("invalid config: {field}: {why}")]
    InvalidConfig {
        field: &'static str,
        why: &'static str,
    },
    /// Requests were rate limited by the server.
    #[error("rate limited: retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },
    /// Structured server error response.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Raw HTTP error when no structured error could be parsed.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    /// The backend answered `success: false`. Carries its message verbatim.
    #[error("{0}")]
    Rejected(String),
    /// A successful envelope did not carry the expected payload.
    #[error("response missing data for {0}")]
    MissingData(&'static str),
    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Order confirmation expired. Please place the order again.")]
    ConfirmationExpired,
    #[error("no pending order to confirm")]
    NoPendingConfirmation,
}

impl Error {
    /// Transport failures and non-success HTTP statuses are worth another attempt;
    /// domain rejections and local validation failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Http { .. }
                | Error::Server { .. }
                | Error::RateLimited { .. }
        )
    }

    /// Text shown to the user in the dashboard error slot.
    pub fn user_message(&self) -> String {
        match self {
            Error::Rejected(message) => message.clone(),
            Error::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => Error::Transport(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerErr {
    #[serde(default, alias = "message", alias = "detail")]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) retry_after: Option<u64>,
}
