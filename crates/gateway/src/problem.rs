use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
const TYPE_BASE: &str = "https://evintake.dev/errors/";

/// An error response in problem format. Rendered with the request's
/// correlation id by [`Problem::into_response_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub status: StatusCode,
    pub code: &'static str,
    pub title: &'static str,
    pub detail: serde_json::Value,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ProblemBody<'a> {
    #[serde(rename = "type")]
    type_uri: String,
    title: &'a str,
    status: u16,
    code: &'a str,
    detail: &'a serde_json::Value,
    correlation_id: &'a str,
}

pub fn type_uri(code: &str) -> String {
    format!("{}{}", TYPE_BASE, code.to_ascii_lowercase().replace('_', "-"))
}

impl Problem {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        title: &'static str,
        detail: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            status,
            code,
            title,
            detail: detail.into(),
            retry_after_secs: None,
        }
    }

    pub fn not_found(detail: impl Into<serde_json::Value>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Not Found", detail)
    }

    pub fn forbidden(detail: impl Into<serde_json::Value>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden", detail)
    }

    pub fn invalid_request(detail: impl Into<serde_json::Value>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "INVALID_REQUEST",
            "Invalid Request",
            detail,
        )
    }

    pub fn unavailable(detail: impl Into<serde_json::Value>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Service Unavailable",
            detail,
        )
    }

    pub fn internal(detail: impl Into<serde_json::Value>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal Error",
            detail,
        )
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "Rate Limit Exceeded",
                format!("retry after {} seconds", retry_after_secs),
            )
        }
    }

    pub fn into_response_with(self, correlation_id: &str) -> Response {
        let body = ProblemBody {
            type_uri: type_uri(self.code),
            title: self.title,
            status: self.status.as_u16(),
            code: self.code,
            detail: &self.detail,
            correlation_id,
        };

        let mut headers = correlation_headers(correlation_id);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(secs) = self.retry_after_secs
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }

        let json = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        (self.status, headers, json).into_response()
    }
}

pub fn correlation_headers(correlation_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    headers
}

/// A JSON success body with the correlation header attached.
pub fn json_response<T: Serialize>(status: StatusCode, correlation_id: &str, body: &T) -> Response {
    (status, correlation_headers(correlation_id), Json(body)).into_response()
}

/// Keeps alphanumerics and `-_.`, at most 64 characters.
pub fn sanitize_correlation_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}
