use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of a single outbound exchange with a model server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {source}")]
    Connect { url: String, #[source] source: BoxError },
    #[error("reading response body from {url} failed: {source}")]
    Body { url: String, #[source] source: BoxError },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("model server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response carried no content")]
    MissingContent,
    #[error("model response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("archive I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid backup: missing metadata.json")]
    MissingMetadata,
    #[error("invalid backup metadata: {0}")]
    BadMetadata(#[source] serde_json::Error),
    #[error("encoding {entry}: {source}")]
    Encode { entry: &'static str, #[source] source: serde_json::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error body returned by HTTP handlers: `{"error": {"code", "message", "details"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "INVALID_INPUT", message: message.into(), details: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, code: "NOT_FOUND", message: message.into(), details: None }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, code: "INTERNAL_ERROR", message: message.into(), details: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": { "code": self.code, "message": self.message, "details": self.details } });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self { ApiError::internal(err.to_string()) }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self { ApiError::internal(format!("{:#}", err)) }
}
