pub mod admin;
pub mod auth_strategy;
pub mod authz;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod permissions;
pub mod project_deleter;
pub mod proxy;
pub mod repo_url;
pub mod routes;
pub mod tags;
pub mod upstream_client;
pub mod url_factory;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth_strategy::{AuthStrategy, AwsEcrAuthStrategy, BasicAuthStrategy, OAuthStrategy};
use crate::config::{Config, UpstreamType};
use crate::proxy::ProxyState;

pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn service_version_header(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&format!("platform-registry-api/{SERVICE_VERSION}")) {
        response.headers_mut().insert("X-Service-Version", value);
    }
    response
}

pub async fn build_auth_strategy(config: &Config, http_client: reqwest::Client) -> anyhow::Result<Arc<dyn AuthStrategy>> {
    match config.upstream.kind {
        UpstreamType::Basic => {
            let basic = config
                .upstream
                .basic
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("upstream.basic missing for type=basic"))?;
            Ok(Arc::new(BasicAuthStrategy::new(basic.username.clone(), basic.password.clone())))
        }
        UpstreamType::Oauth => {
            let oauth = config
                .upstream
                .oauth
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("upstream.oauth missing for type=oauth"))?;
            Ok(Arc::new(OAuthStrategy::new(
                http_client,
                url::Url::parse(&oauth.token_url)?,
                oauth.token_service.clone(),
                oauth.token_username.clone(),
                oauth.token_password.clone(),
                oauth.token_registry_catalog_scope.clone(),
                oauth.token_repository_scope_actions.clone(),
            )))
        }
        UpstreamType::AwsEcr => {
            let aws_cfg = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
            let ecr = aws_sdk_ecr::Client::new(&aws_cfg);
            Ok(Arc::new(AwsEcrAuthStrategy::new(ecr)))
        }
    }
}

/// Builds the full axum router over `state`. Shared between `main` and
/// integration tests so both exercise the exact same route wiring.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/ping", get(routes::handle_ping))
        .route("/v2/", get(routes::handle_version_check))
        .route("/v2/_catalog", get(routes::handle_catalog_route))
        .route("/v2/*rest", any(routes::handle_v2_dispatch))
        .route("/artifacts-uploads/*rest", any(proxy::handle_proxy))
        .route("/artifacts-downloads/*rest", any(proxy::handle_proxy))
        .layer(middleware::from_fn(service_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
