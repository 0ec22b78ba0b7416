use aws_sdk_ecr::types::{ListImagesFilter, TagStatus};
use serde_json::{json, Value};

use crate::error::{ProxyError, Result};
use crate::upstream_client::UpstreamClient;

/// Generic tags-list response: proxy the GET, then rewrite the repo name
/// embedded in the body back to the registry-facing name (spec.md §4.8).
/// `content_type` is treated as optional since some upstreams reply
/// `text/plain` for a JSON body.
pub async fn handle_generic_tags_list(upstream: &UpstreamClient, registry_repo: &str, mut body: Value) -> Value {
    if let Some(name) = body.get_mut("name") {
        *name = json!(registry_repo);
    }
    if let Some(errors) = body.get_mut("errors").and_then(Value::as_array_mut) {
        for error in errors {
            if let Some(detail_name) = error.pointer_mut("/detail/name") {
                *detail_name = json!(registry_repo);
            }
        }
    }
    let _ = upstream;
    body
}

/// AWS-ECR-specific tags list: `ListImages(filter=TAGGED)` rather than a
/// generic proxy GET, because ECR's own tags-list endpoint semantics
/// differ from Docker Registry v2 (spec.md §4.8).
pub async fn handle_ecr_tags_list(
    client: &aws_sdk_ecr::Client,
    upstream_repo: &str,
    registry_repo: &str,
    next_token: Option<&str>,
) -> Result<(Value, Option<String>)> {
    let mut request = client
        .list_images()
        .repository_name(upstream_repo)
        .filter(ListImagesFilter::builder().tag_status(TagStatus::Tagged).build());
    if let Some(token) = next_token {
        request = request.next_token(token);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            if e.as_service_error().map(|se| se.is_repository_not_found_exception()).unwrap_or(false) {
                return Err(ProxyError::NotFound(format!("repository \"{registry_repo}\" not known to registry")));
            }
            return Err(ProxyError::InvalidRequest(format!("ECR ListImages failed: {e}")));
        }
    };

    let image_ids = response.image_ids();
    if image_ids.is_empty() && response.next_token().is_none() {
        cleanup_empty_repository(client, upstream_repo).await?;
    }

    let tags: Vec<String> = image_ids.iter().filter_map(|id| id.image_tag()).map(str::to_string).collect();

    Ok((
        json!({"name": registry_repo, "tags": tags}),
        response.next_token().map(str::to_string),
    ))
}

async fn cleanup_empty_repository(client: &aws_sdk_ecr::Client, upstream_repo: &str) -> Result<()> {
    match client.delete_repository().repository_name(upstream_repo).force(false).send().await {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.as_service_error()
                .map(|se| se.is_repository_not_empty_exception() || se.is_repository_not_found_exception())
                .unwrap_or(false)
            {
                Ok(())
            } else {
                Err(ProxyError::InvalidRequest(format!("ECR DeleteRepository cleanup failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generic_tags_list_rewrites_name_and_error_detail() {
        let body = json!({
            "name": "testproject/alice/foo",
            "tags": ["v1"],
            "errors": [{"code": "NAME_UNKNOWN", "detail": {"name": "testproject/alice/foo"}}]
        });
        let upstream = crate::upstream_client::UpstreamClient::new(
            url::Url::parse("https://upstream.example").unwrap(),
            "testproject".to_string(),
            None,
            std::sync::Arc::new(crate::auth_strategy::BasicAuthStrategy::new("u", "p")),
            1000,
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(30),
        )
        .unwrap();
        let rewritten = handle_generic_tags_list(&upstream, "alice/foo", body).await;
        assert_eq!(rewritten["name"], "alice/foo");
        assert_eq!(rewritten["errors"][0]["detail"]["name"], "alice/foo");
    }
}
