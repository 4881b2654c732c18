use thiserror::Error;

pub type WsResult<T> = std::result::Result<T, WsClientError>;

#[derive(Debug, Error)]
pub enum WsClientError {
    #[error("invalid websocket message: {0}")]
    InvalidMessage(String),
    #[error("unsupported websocket scheme {0}")]
    UnsupportedScheme(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
