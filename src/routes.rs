use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::authz::BasicCredentials;
use crate::catalog::handle_catalog;
use crate::config::UpstreamType;
use crate::error::{ProxyError, Result};
use crate::proxy::ProxyState;
use crate::tags::{handle_ecr_tags_list, handle_generic_tags_list};

fn caller_identity(realm: &str, headers: &HeaderMap) -> Result<BasicCredentials> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ProxyError::unauthorized(realm, "missing Authorization header"))?
        .to_str()
        .map_err(|_| ProxyError::MalformedCredentials("Authorization header is not valid utf-8".into()))?;
    BasicCredentials::from_authorization_header(value)
}

pub async fn handle_ping() -> &'static str {
    "pong"
}

pub async fn handle_version_check(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Result<Response> {
    caller_identity(&state.config.server.name, &headers)?;
    let body = state.upstream.v2().await?;
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogQuery {
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

const DEFAULT_CATALOG_PAGE: usize = 1000;

pub async fn handle_catalog_route(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Query(query): Query<CatalogQuery>,
) -> Result<Response> {
    let credentials = caller_identity(&state.config.server.name, &headers)?;
    let requested_n = query.n.unwrap_or(DEFAULT_CATALOG_PAGE);

    let tree = state
        .authz
        .get_permissions_tree(&credentials, &format!("image://{}", state.config.cluster.name))
        .await?;

    let project_prefix = match &state.config.upstream.repo {
        Some(repo) if !repo.is_empty() => format!("{}/{repo}", state.config.upstream.project),
        _ => state.config.upstream.project.clone(),
    };

    let result = handle_catalog(&state.upstream, &tree, &project_prefix, requested_n, query.last.as_deref()).await?;

    let mut response = Json(json!({"repositories": result.repositories})).into_response();
    if let Some(last) = result.next_last {
        let link = format!("</v2/_catalog?n={}&last={last}>; rel=\"next\"", state.config.upstream.max_catalog_entries);
        if let Ok(value) = HeaderValue::from_str(&link) {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}

/// Called from the `/v2/*rest` dispatcher once it recognizes a
/// `{repo}/tags/list` suffix; `repo` may itself contain slashes, so this
/// is not wired up as a literal axum route.
pub async fn handle_tags_list_route(
    state: Arc<ProxyState>,
    headers: &HeaderMap,
    repo: String,
    next_token: Option<&str>,
) -> Result<Response> {
    let credentials = caller_identity(&state.config.server.name, headers)?;
    let permission = crate::permissions::Permission::read(format!("image://{}/{repo}", state.config.cluster.name));
    let allowed = state.authz.check_permissions(&credentials, &[permission]).await?;
    if !allowed {
        return Err(ProxyError::permission_denied(
            &state.config.server.name,
            format!("no read access to repository \"{repo}\""),
        ));
    }

    let upstream_repo = state.upstream.upstream_repo_name(&repo);

    if state.config.upstream.kind == UpstreamType::AwsEcr {
        let client = state
            .ecr_client
            .as_ref()
            .ok_or_else(|| ProxyError::UpstreamProtocol("ECR client not configured".into()))?;
        let (body, returned_next_token) = handle_ecr_tags_list(client, &upstream_repo, &repo, next_token).await?;
        let mut response = Json(body).into_response();
        if let Some(token) = returned_next_token {
            let link = format!("</v2/{repo}/tags/list?n={token}>; rel=\"next\"");
            if let Ok(value) = HeaderValue::from_str(&link) {
                response.headers_mut().insert(header::LINK, value);
            }
        }
        return Ok(response);
    }

    let (status, body, next) = state.upstream.tags_list_raw(&repo).await?;
    let rewritten = handle_generic_tags_list(&state.upstream, &repo, body).await;
    let mut response = (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), Json(rewritten)).into_response();
    if let Some((n, last)) = next {
        let link = format!("</v2/{repo}/tags/list?n={n}&last={last}>; rel=\"next\"");
        if let Ok(value) = HeaderValue::from_str(&link) {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}

pub async fn handle_unsupported_method() -> Result<Response> {
    Err(ProxyError::InvalidRequest("unsupported request path".into()))
}

/// Entry point for `/v2/*rest`: everything other than the version check
/// and `_catalog` (registered as their own literal routes) funnels
/// through here, since a repo name may itself contain slashes and can't
/// be captured by a single axum path parameter. A GET against a
/// `{repo}/tags/list` suffix is routed to the tags-list handler; every
/// other `(tags|manifests|blobs)` suffix goes through the generic
/// streaming proxy.
pub async fn handle_v2_dispatch(
    State(state): State<Arc<ProxyState>>,
    req: axum::http::Request<axum::body::Body>,
) -> Result<Response> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let mut probe_url = state.url_factory.create_registry_version_check_url();
    probe_url.set_path(&path);
    probe_url.set_query(query.as_deref());
    let repo_url = crate::repo_url::RepoURL::from_url(&probe_url)?;

    let is_tags_list = !repo_url.allow_skip_perms
        && method == axum::http::Method::GET
        && repo_url.suffix().map(|s| s.trim_end_matches('/') == "tags/list").unwrap_or(false);

    if is_tags_list {
        let headers = req.headers().clone();
        let next_token = query.as_ref().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "n")
                .map(|(_, v)| v.into_owned())
        });
        return handle_tags_list_route(state, &headers, repo_url.repo, next_token.as_deref()).await;
    }

    crate::proxy::handle_proxy(State(state), req).await
}
