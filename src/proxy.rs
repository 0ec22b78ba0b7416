use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::Response;
use tracing::error;

use crate::auth_strategy::convert_ecr_failure;
use crate::authz::{AuthorizationService, BasicCredentials};
use crate::config::{Config, UpstreamType};
use crate::error::{ProxyError, Result, UpstreamBody};
use crate::permissions::Permission;
use crate::repo_url::RepoURL;
use crate::upstream_client::UpstreamClient;
use crate::url_factory::URLFactory;

const HOP_BY_HOP_REQUEST: [&str; 3] = ["host", "transfer-encoding", "connection"];
const HOP_BY_HOP_RESPONSE: [&str; 3] = ["transfer-encoding", "content-encoding", "connection"];

pub struct ProxyState {
    pub config: Arc<Config>,
    pub url_factory: URLFactory,
    pub upstream: Arc<UpstreamClient>,
    pub authz: Arc<dyn AuthorizationService>,
    pub ecr_client: Option<aws_sdk_ecr::Client>,
}

fn is_pull_request(method: &Method) -> bool {
    method == Method::HEAD || method == Method::GET
}

fn caller_identity(realm: &str, headers: &HeaderMap) -> Result<BasicCredentials> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| ProxyError::unauthorized(realm, "missing Authorization header"))?
        .to_str()
        .map_err(|_| ProxyError::MalformedCredentials("Authorization header is not valid utf-8".into()))?;
    BasicCredentials::from_authorization_header(value)
}

fn strip_hop_by_hop(headers: &HeaderMap, drop: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if drop.iter().any(|d| name.as_str().eq_ignore_ascii_case(d)) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Entry point for `*  /v2/{repo}/(tags|manifests|blobs)/*` and the
/// passthrough path families (spec.md §4.7).
pub async fn handle_proxy(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let credentials = caller_identity(&state.config.server.name, &parts.headers)?;

    let mut registry_url = state.url_factory.create_registry_version_check_url();
    registry_url.set_path(parts.uri.path());
    registry_url.set_query(parts.uri.query());
    let repo_url = RepoURL::from_url(&registry_url)?;

    if !repo_url.allow_skip_perms {
        let required_action = if is_pull_request(&parts.method) {
            crate::permissions::Action::Read
        } else {
            crate::permissions::Action::Write
        };
        let mut permissions = vec![Permission {
            uri: format!("image://{}/{}", state.config.cluster.name, repo_url.repo),
            action: required_action,
        }];
        if let Some(mounted) = &repo_url.mounted_repo {
            permissions.push(Permission::read(format!("image://{}/{mounted}", state.config.cluster.name)));
        }
        let allowed = state.authz.check_permissions(&credentials, &permissions).await?;
        if !allowed {
            return Err(ProxyError::permission_denied(
                &state.config.server.name,
                format!("no access to repository \"{}\"", repo_url.repo),
            ));
        }
    }

    let upstream_repo_url = state.url_factory.create_upstream_repo_url(&repo_url);

    if !is_pull_request(&parts.method) {
        state.upstream.auth().create_repo(&upstream_repo_url.repo).await?;
    }

    if state.config.upstream.kind == UpstreamType::AwsEcr
        && parts.method == Method::DELETE
        && upstream_repo_url.url.path().contains("/manifests/")
    {
        return handle_ecr_manifest_delete(&state, &upstream_repo_url).await;
    }

    let scopes = state
        .upstream
        .repo_scopes_for(&repo_url.repo, repo_url.mounted_repo.as_deref());
    let auth_headers = state.upstream.auth().get_headers(&scopes).await?;

    let mut outgoing_headers = strip_hop_by_hop(&parts.headers, &HOP_BY_HOP_REQUEST);
    for (key, value) in &auth_headers {
        if let (Ok(name), Ok(val)) = (HeaderName::try_from(key.as_str()), HeaderValue::from_str(value)) {
            outgoing_headers.insert(name, val);
        }
    }

    let follow_redirects =
        state.config.upstream.kind == UpstreamType::AwsEcr && parts.method == Method::GET && upstream_repo_url.url.path().contains("/blobs/");

    let reqwest_body = if parts.method == Method::HEAD {
        None
    } else {
        Some(reqwest::Body::wrap_stream(body.into_data_stream()))
    };
    let reqwest_method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| ProxyError::InvalidRequest(format!("unsupported HTTP method {}", parts.method)))?;
    let reqwest_headers = to_reqwest_headers(&outgoing_headers);

    let upstream_response = state
        .upstream
        .proxy_request(
            reqwest_method,
            upstream_repo_url.url.clone(),
            reqwest_headers,
            reqwest_body,
            follow_redirects,
            is_pull_request(&parts.method),
        )
        .await?;

    let status = upstream_response.status().as_u16();
    if status >= 500 {
        error!(status, headers = ?upstream_response.headers(), "upstream returned a server error");
    }

    let mut response_headers = strip_hop_by_hop(&axum_headers_from_reqwest(upstream_response.headers()), &HOP_BY_HOP_RESPONSE);
    if let Some(location) = response_headers.get(axum::http::header::LOCATION).cloned() {
        if let Ok(location_str) = location.to_str() {
            let rewritten = state.url_factory.rewrite_location(location_str)?;
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                response_headers.insert(axum::http::header::LOCATION, value);
            }
        }
    }

    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let stream = upstream_response.bytes_stream();
    let mut builder = Response::builder().status(status_code);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(Body::from_stream(stream)).unwrap())
}

async fn handle_ecr_manifest_delete(state: &ProxyState, upstream_repo_url: &RepoURL) -> Result<Response> {
    let client = state
        .ecr_client
        .as_ref()
        .ok_or_else(|| ProxyError::UpstreamProtocol("ECR client not configured".into()))?;

    let reference = upstream_repo_url
        .url
        .path()
        .rsplit('/')
        .next()
        .ok_or_else(|| ProxyError::InvalidRequest("manifest delete path missing reference".into()))?;
    let repo = &upstream_repo_url.repo;

    let image_id = if reference.starts_with("sha256:") {
        aws_sdk_ecr::types::ImageIdentifier::builder().image_digest(reference).build()
    } else {
        aws_sdk_ecr::types::ImageIdentifier::builder().image_tag(reference).build()
    };

    let response = client
        .batch_delete_image()
        .repository_name(repo)
        .image_ids(image_id)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(format!("ECR BatchDeleteImage failed: {e}")))?;

    let _ = client.delete_repository().repository_name(repo).force(false).send().await;

    let failures = response.failures();
    let (status, body) = if failures.is_empty() {
        (202, serde_json::json!({}))
    } else {
        let failure = &failures[0];
        convert_ecr_failure(
            failure.failure_code().map(|c| c.as_str()).unwrap_or("Unknown"),
            failure.failure_reason().unwrap_or(""),
        )
    };

    Err(ProxyError::Upstream { status, body: UpstreamBody::Json(body) })
}

fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

fn axum_headers_from_reqwest(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
            out.append(n, v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn strip_hop_by_hop_removes_configured_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let stripped = strip_hop_by_hop(&headers, &HOP_BY_HOP_REQUEST);
        assert!(!stripped.contains_key(axum::http::header::HOST));
        assert!(stripped.contains_key(axum::http::header::CONTENT_TYPE));
    }

    #[test]
    fn is_pull_request_true_for_head_and_get() {
        assert!(is_pull_request(&Method::GET));
        assert!(is_pull_request(&Method::HEAD));
        assert!(!is_pull_request(&Method::POST));
    }
}
