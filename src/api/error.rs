use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use tracing::Span;

use super::respond::render;
use super::types::ResponseEnvelope;

/// Internal failures: anything that is not a structured refusal. Refusals
/// never travel this path, they are rendered eagerly by the handlers.
pub struct Error(pub anyhow::Error);

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let message = format!("{:#}", self.0);
        Span::current().record("error", message.clone());
        let envelope = ResponseEnvelope {
            request_id: String::new(),
            response_timestamp: Utc::now(),
            response_state_epoch: None,
            response_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            error_code: None,
            error_slug: None,
            error_lines: Some(vec![message]),
            info_lines: None,
            response_entries: None,
            response: serde_json::Value::Null,
        };
        render(StatusCode::INTERNAL_SERVER_ERROR, envelope, &[])
    }
}

pub type Result<T> = std::result::Result<T, Error>;
