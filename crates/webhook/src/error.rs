use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Transport-level failures. Anything past envelope checks is answered with
/// an admission response instead.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("unsupported content type {0:?}, expect application/json")]
    UnsupportedMediaType(String),
    #[error("empty request body")]
    EmptyBody,
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            WebhookError::EmptyBody => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
