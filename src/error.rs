use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Body carried by an `UpstreamError`: passed through verbatim as JSON
/// when the upstream replied with JSON, as plain text otherwise.
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Json(Value),
    Text(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The Authorization header is missing or unparseable -> 400.
    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    /// No valid caller identity -> 401 with `WWW-Authenticate`.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, realm: String },

    /// Authorization-service permission check failed. Surfaced as 401,
    /// not 403, for registry-client compatibility (spec.md §7).
    #[error("permission denied: {message}")]
    PermissionDenied { message: String, realm: String },

    /// Unknown query params, malformed path, etc. -> 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Repository not mapped / not found -> 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-2xx upstream response.
    #[error("upstream error: {status}")]
    Upstream { status: u16, body: UpstreamBody },

    /// Unexpected upstream payload shape (e.g. OAuth response lacking a
    /// token) -> 502.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn unauthorized(realm: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Unauthorized {
            message: message.into(),
            realm: realm.into(),
        }
    }

    pub fn permission_denied(realm: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::PermissionDenied {
            message: message.into(),
            realm: realm.into(),
        }
    }

    /// Scrubs occurrences of `project` out of a 404 upstream body so the
    /// caller never sees the internal upstream project prefix (spec.md
    /// §7, scenario 1).
    pub fn scrub_project(status: u16, body: UpstreamBody, project: &str) -> Self {
        if status != 404 || project.is_empty() {
            return ProxyError::Upstream { status, body };
        }
        let scrubbed = match body {
            UpstreamBody::Json(mut value) => {
                scrub_json(&mut value, project);
                UpstreamBody::Json(value)
            }
            UpstreamBody::Text(text) => UpstreamBody::Text(text.replace(&format!("{project}/"), "")),
        };
        ProxyError::Upstream { status, body: scrubbed }
    }
}

fn scrub_json(value: &mut Value, project: &str) {
    let prefix = format!("{project}/");
    match value {
        Value::String(s) if s.contains(&prefix) => {
            *s = s.replace(&prefix, "");
        }
        Value::String(_) => {}
        Value::Array(items) => {
            for item in items {
                scrub_json(item, project);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                scrub_json(v, project);
            }
        }
        _ => {}
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::MalformedCredentials(msg) => {
                (StatusCode::BAD_REQUEST, registry_error_body("DENIED", &msg)).into_response()
            }
            ProxyError::Unauthorized { message, realm } => (
                StatusCode::UNAUTHORIZED,
                [("WWW-Authenticate", format!("Basic realm=\"{realm}\""))],
                registry_error_body("UNAUTHORIZED", &message),
            )
                .into_response(),
            ProxyError::PermissionDenied { message, realm } => (
                StatusCode::UNAUTHORIZED,
                [("WWW-Authenticate", format!("Basic realm=\"{realm}\""))],
                registry_error_body("DENIED", &message),
            )
                .into_response(),
            ProxyError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, registry_error_body("UNSUPPORTED", &msg)).into_response()
            }
            ProxyError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, registry_error_body("NAME_UNKNOWN", &msg)).into_response()
            }
            ProxyError::Upstream { status, body } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                match body {
                    UpstreamBody::Json(value) => (status, Json(value)).into_response(),
                    UpstreamBody::Text(text) => (status, text).into_response(),
                }
            }
            ProxyError::UpstreamProtocol(msg) => {
                (StatusCode::BAD_GATEWAY, registry_error_body("UNSUPPORTED", &msg)).into_response()
            }
            ProxyError::Reqwest(e) => (
                StatusCode::BAD_GATEWAY,
                registry_error_body("UNSUPPORTED", &format!("upstream registry error: {e}")),
            )
                .into_response(),
            ProxyError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                registry_error_body("UNKNOWN", &e.to_string()),
            )
                .into_response(),
        }
    }
}

fn registry_error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({
        "errors": [{
            "code": code,
            "message": message,
        }]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_project_removes_prefix_from_detail_name() {
        let body = UpstreamBody::Json(json!({
            "errors": [{"code": "NAME_UNKNOWN", "detail": {"name": "testproject/alice/foo"}}]
        }));
        let err = ProxyError::scrub_project(404, body, "testproject");
        match err {
            ProxyError::Upstream { body: UpstreamBody::Json(v), .. } => {
                assert_eq!(v["errors"][0]["detail"]["name"], "alice/foo");
            }
            _ => panic!("expected Upstream variant"),
        }
    }

    #[test]
    fn scrub_project_is_noop_for_non_404() {
        let body = UpstreamBody::Json(json!({"detail": {"name": "testproject/alice"}}));
        let err = ProxyError::scrub_project(500, body, "testproject");
        match err {
            ProxyError::Upstream { body: UpstreamBody::Json(v), .. } => {
                assert_eq!(v["detail"]["name"], "testproject/alice");
            }
            _ => panic!("expected Upstream variant"),
        }
    }
}
