use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registry_proxy::authz::HttpAuthorizationService;
use registry_proxy::config::{Config, UpstreamType};
use registry_proxy::events::InProcessEventBusClient;
use registry_proxy::project_deleter::ProjectDeleter;
use registry_proxy::proxy::ProxyState;
use registry_proxy::upstream_client::UpstreamClient;
use registry_proxy::url_factory::URLFactory;
use registry_proxy::{build_auth_strategy, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "registry_proxy=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    info!(upstream = %config.upstream.url, kind = ?config.upstream.kind, "starting registry proxy");

    let http_client = reqwest::Client::new();
    let auth_strategy = build_auth_strategy(&config, http_client.clone()).await?;

    let upstream_url = url::Url::parse(&config.upstream.url)?;
    let upstream = Arc::new(UpstreamClient::new(
        upstream_url.clone(),
        config.upstream.project.clone(),
        config.upstream.repo.clone(),
        auth_strategy,
        config.upstream.max_catalog_entries,
        Duration::from_secs(config.upstream.sock_connect_timeout_s),
        Duration::from_secs(config.upstream.sock_read_timeout_s),
    )?);

    let authz = Arc::new(HttpAuthorizationService::new(
        http_client.clone(),
        url::Url::parse(&config.auth.server_endpoint_url)?,
        config.auth.service_token.clone(),
    ));

    let ecr_client = if config.upstream.kind == UpstreamType::AwsEcr {
        let aws_cfg = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        Some(aws_sdk_ecr::Client::new(&aws_cfg))
    } else {
        None
    };

    let registry_endpoint = url::Url::parse(&format!("http://{}:{}", config.server.bind_address, config.server.port))?;
    let url_factory = URLFactory::new(
        registry_endpoint,
        upstream_url,
        config.upstream.project.clone(),
        config.upstream.repo.clone(),
    );

    let proxy_state = Arc::new(ProxyState {
        config: config.clone(),
        url_factory,
        upstream: upstream.clone(),
        authz,
        ecr_client,
    });

    let events_client = Arc::new(InProcessEventBusClient::new());
    let project_deleter = Arc::new(ProjectDeleter::new(upstream.clone(), events_client));
    project_deleter.subscribe().await?;

    let app = build_router(proxy_state);

    let bind_addr = format!("{}:{}", config.server.bind_address, config.server.port);
    info!(bind_addr, "listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
