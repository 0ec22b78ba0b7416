use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response};
use serde_json::Value;
use tokio::sync::Semaphore;
use url::Url;

use crate::auth_strategy::AuthStrategy;
use crate::error::{ProxyError, Result, UpstreamBody};

const MAX_DELETE_CONCURRENCY: usize = 5;

fn is_success(status: reqwest::StatusCode) -> bool {
    status.is_success()
}

async fn check_status(response: Response, project: &str) -> Result<Response> {
    if is_success(response.status()) {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let text = response.text().await.unwrap_or_default();
    let body = if content_type.contains("json") {
        serde_json::from_str::<Value>(&text)
            .map(UpstreamBody::Json)
            .unwrap_or(UpstreamBody::Text(text))
    } else {
        UpstreamBody::Text(text)
    };
    Err(ProxyError::scrub_project(status, body, project))
}

/// One page of a raw upstream `/v2/_catalog` response, with the next
/// page's `n`/`last` extracted from `Link: rel="next"`.
pub struct CatalogPage {
    pub repositories: Vec<String>,
    pub next: Option<(usize, String)>,
}

fn parse_link_next(header_value: &str, base: &Url) -> Option<(usize, String)> {
    let segment = header_value.split(',').find(|s| s.contains("rel=\"next\""))?;
    let start = segment.find('<')? + 1;
    let end = segment.find('>')?;
    let raw = &segment[start..end];
    let url = base.join(raw).ok()?;
    let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
    let n = pairs.get("n").and_then(|s| s.parse().ok())?;
    let last = pairs.get("last").cloned().unwrap_or_default();
    Some((n, last))
}

/// Owns the HTTP client to the upstream registry, the scoped auth
/// strategy, and the process-wide delete semaphore (spec.md §4.5, §5).
pub struct UpstreamClient {
    client: reqwest::Client,
    redirecting_client: reqwest::Client,
    base_url: Url,
    project: String,
    repo: Option<String>,
    auth: Arc<dyn AuthStrategy>,
    delete_sem: Arc<Semaphore>,
    pub max_catalog_entries: usize,
    sock_read_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        base_url: Url,
        project: String,
        repo: Option<String>,
        auth: Arc<dyn AuthStrategy>,
        max_catalog_entries: usize,
        sock_connect_timeout: Duration,
        sock_read_timeout: Duration,
    ) -> Result<Self> {
        // No total-request timeout here: pushes may be arbitrarily long.
        // `sock_read_timeout` is instead applied per-request, only to pull
        // requests, via `with_read_timeout` below.
        let client = reqwest::Client::builder()
            .connect_timeout(sock_connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let redirecting_client = reqwest::Client::builder()
            .connect_timeout(sock_connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            redirecting_client,
            base_url,
            project,
            repo,
            auth,
            delete_sem: Arc::new(Semaphore::new(MAX_DELETE_CONCURRENCY)),
            max_catalog_entries,
            sock_read_timeout,
        })
    }

    /// Applies `sock_read_timeout` to a request builder. Used for every
    /// pull-direction call this client makes on its own (catalog, tags,
    /// manifest digest lookups, deletes) and, from `proxy_request`, for
    /// proxied pull requests only.
    fn with_read_timeout(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.timeout(self.sock_read_timeout)
    }

    fn prefix(&self) -> String {
        match &self.repo {
            Some(r) if !r.is_empty() => format!("{}/{r}", self.project),
            _ => self.project.clone(),
        }
    }

    pub fn upstream_repo_name(&self, repo: &str) -> String {
        let prefix = self.prefix();
        if repo.starts_with(&format!("{prefix}/")) {
            repo.to_string()
        } else {
            format!("{prefix}/{repo}")
        }
    }

    pub fn registry_repo_name(&self, repo: &str) -> String {
        let prefix = format!("{}/", self.prefix());
        repo.strip_prefix(&prefix).unwrap_or(repo).to_string()
    }

    pub fn is_gar(&self) -> bool {
        self.base_url.host_str().map(|h| h.ends_with(".pkg.dev")).unwrap_or(false)
    }

    pub fn auth(&self) -> &Arc<dyn AuthStrategy> {
        &self.auth
    }

    fn catalog_scopes(&self) -> Vec<String> {
        vec!["registry:catalog:*".to_string()]
    }

    fn repo_scopes(&self, repo: &str, mounted_repo: Option<&str>) -> Vec<String> {
        let mut scopes = vec![format!("repository:{}:*", self.upstream_repo_name(repo))];
        if let Some(mounted) = mounted_repo {
            scopes.push(format!("repository:{}:*", self.upstream_repo_name(mounted)));
        }
        scopes
    }

    fn v2_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/v2/");
        url
    }

    fn catalog_url(&self, n: usize, last: Option<&str>) -> Url {
        let mut url = self.v2_url();
        url.set_path("/v2/_catalog");
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("n", &n.to_string());
            if let Some(last) = last {
                if !last.is_empty() {
                    pairs.append_pair("last", last);
                }
            }
        }
        url
    }

    fn tags_list_url(&self, repo: &str) -> Url {
        let mut url = self.v2_url();
        url.set_path(&format!("/v2/{}/tags/list", self.upstream_repo_name(repo)));
        url
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> Url {
        let mut url = self.v2_url();
        url.set_path(&format!("/v2/{}/manifests/{}", self.upstream_repo_name(repo), reference));
        url
    }

    pub async fn v2(&self) -> Result<Value> {
        let headers = self.auth.get_headers(&[]).await?;
        let mut req = self.with_read_timeout(self.client.get(self.v2_url()));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        Ok(response.json().await?)
    }

    /// Fetches a single raw catalog page. Used by both `list_images` and
    /// the public catalog handler's oversampling loop.
    pub async fn fetch_catalog_page(&self, n: usize, last: Option<&str>) -> Result<CatalogPage> {
        let url = self.catalog_url(n, last);
        let headers = self.auth.get_headers(&self.catalog_scopes()).await?;
        let mut req = self.with_read_timeout(self.client.get(url.clone()));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        let next = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| parse_link_next(s, &url));
        let payload: Value = response.json().await?;
        let repositories = payload
            .get("repositories")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        Ok(CatalogPage { repositories, next })
    }

    /// Iterates catalog pages, yielding images under `{prefix}/{org}/{project}/`
    /// stripped of the upstream prefix.
    pub async fn list_images(&self, org: &str, project: &str, page_size: usize, last: Option<&str>) -> Result<Vec<String>> {
        let scope_prefix = format!("{}/{org}/{project}/", self.prefix());
        let prefix = self.prefix();
        let mut images = Vec::new();
        let mut cursor = last.map(str::to_string);
        loop {
            let page = self.fetch_catalog_page(page_size, cursor.as_deref()).await?;
            if page.repositories.is_empty() {
                break;
            }
            for image in &page.repositories {
                if image.starts_with(&scope_prefix) {
                    images.push(image[prefix.len() + 1..].to_string());
                }
            }
            match page.next {
                Some((_, next_last)) => cursor = Some(next_last),
                None => break,
            }
        }
        Ok(images)
    }

    pub async fn image_tags_list(&self, repo: &str) -> Result<Vec<String>> {
        let scopes = self.repo_scopes(repo, None);
        let headers = self.auth.get_headers(&scopes).await?;
        let mut req = self.with_read_timeout(self.client.get(self.tags_list_url(repo)));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        let payload: Value = response.json().await?;
        Ok(payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Generic (non-ECR) tags-list proxy: forwards the GET as-is and
    /// returns the raw status, body, and next-page cursor for the caller
    /// to rewrite back to registry-facing names (spec.md §4.8). The body
    /// is parsed as JSON regardless of `Content-Type`, since some
    /// upstreams reply `text/plain` for a JSON payload.
    pub async fn tags_list_raw(&self, repo: &str) -> Result<(u16, Value, Option<(usize, String)>)> {
        let scopes = self.repo_scopes(repo, None);
        let headers = self.auth.get_headers(&scopes).await?;
        let url = self.tags_list_url(repo);
        let mut req = self.with_read_timeout(self.client.get(url.clone()));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = req.send().await?;
        let status = response.status().as_u16();
        let next = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| parse_link_next(s, &url));
        let text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok((status, body, next))
    }

    pub async fn image_digest(&self, repo: &str, tag: &str) -> Result<String> {
        let scopes = self.repo_scopes(repo, None);
        let headers = self.auth.get_headers(&scopes).await?;
        let mut req = self.with_read_timeout(
            self.client
                .get(self.manifest_url(repo, tag))
                .header("Accept", "application/vnd.docker.distribution.manifest.v2+json"),
        );
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::UpstreamProtocol("manifest response missing Docker-Content-Digest".into()))
    }

    pub async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        let _permit = self.delete_sem.acquire().await.expect("semaphore not closed");
        let scopes = self.repo_scopes(repo, None);
        let headers = self.auth.get_headers(&scopes).await?;
        let mut req = self.client.delete(self.manifest_url(repo, tag));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        if response.status().as_u16() != 202 {
            return Err(ProxyError::UpstreamProtocol(format!(
                "expected 202 deleting tag {repo}:{tag}, got {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// On GAR (`.pkg.dev`) upstreams, tags must be deleted before the
    /// manifest digest itself (spec.md §4.5).
    pub async fn delete_manifest(&self, repo: &str, digest: &str, tags: &[String]) -> Result<()> {
        if self.is_gar() {
            for tag in tags {
                self.delete_tag(repo, tag).await?;
            }
        }
        let _permit = self.delete_sem.acquire().await.expect("semaphore not closed");
        let scopes = self.repo_scopes(repo, None);
        let headers = self.auth.get_headers(&scopes).await?;
        let mut req = self.client.delete(self.manifest_url(repo, digest));
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        let response = check_status(req.send().await?, &self.prefix()).await?;
        if response.status().as_u16() != 202 {
            return Err(ProxyError::UpstreamProtocol(format!(
                "expected 202 deleting manifest {repo}@{digest}, got {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn delete_project_images(&self, org: &str, project: &str) -> Result<()> {
        let images = self.list_images(org, project, self.max_catalog_entries, None).await?;
        for repo in images {
            let tags = self.image_tags_list(&repo).await?;
            let mut by_digest: HashMap<String, Vec<String>> = HashMap::new();
            for tag in tags {
                let digest = self.image_digest(&repo, &tag).await?;
                by_digest.entry(digest).or_default().push(tag);
            }
            let deletes = by_digest.into_iter().map(|(digest, tags)| {
                let repo = repo.clone();
                async move { self.delete_manifest(&repo, &digest, &tags).await }
            });
            futures::future::try_join_all(deletes).await?;
        }
        Ok(())
    }

    /// The generic streaming pass-through: sends `request` to `url` with
    /// `headers` and an optional streamed body, returning the raw
    /// upstream response for the caller to translate into a client
    /// response. Redirects are followed only when `follow_redirects` is
    /// set (ECR blob GETs redirecting to S3).
    pub async fn proxy_request(
        &self,
        method: Method,
        url: Url,
        headers: reqwest::header::HeaderMap,
        body: Option<reqwest::Body>,
        follow_redirects: bool,
        is_pull: bool,
    ) -> Result<Response> {
        let client = if follow_redirects { &self.redirecting_client } else { &self.client };
        let mut req = client.request(method, url).headers(headers);
        if is_pull {
            req = req.timeout(self.sock_read_timeout);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req.send().await?)
    }

    pub fn repo_scopes_for(&self, repo: &str, mounted_repo: Option<&str>) -> Vec<String> {
        self.repo_scopes(repo, mounted_repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_link_next_extracts_n_and_last() {
        let base = Url::parse("https://upstream.example/v2/_catalog?n=10").unwrap();
        let header = "</v2/_catalog?n=10&last=cursor123>; rel=\"next\"";
        let (n, last) = parse_link_next(header, &base).unwrap();
        assert_eq!(n, 10);
        assert_eq!(last, "cursor123");
    }

    #[test]
    fn parse_link_next_returns_none_without_next_rel() {
        let base = Url::parse("https://upstream.example/v2/_catalog").unwrap();
        assert!(parse_link_next("</foo>; rel=\"prev\"", &base).is_none());
    }

    fn client() -> UpstreamClient {
        UpstreamClient::new(
            Url::parse("https://upstream.example").unwrap(),
            "testproject".to_string(),
            None,
            Arc::new(crate::auth_strategy::BasicAuthStrategy::new("u", "p")),
            1000,
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn upstream_repo_name_adds_prefix_once() {
        let c = client();
        assert_eq!(c.upstream_repo_name("alice/foo"), "testproject/alice/foo");
        assert_eq!(c.upstream_repo_name("testproject/alice/foo"), "testproject/alice/foo");
    }

    #[test]
    fn registry_repo_name_strips_prefix() {
        let c = client();
        assert_eq!(c.registry_repo_name("testproject/alice/foo"), "alice/foo");
        assert_eq!(c.registry_repo_name("alice/foo"), "alice/foo");
    }

    #[test]
    fn is_gar_detects_pkg_dev_host() {
        let c = UpstreamClient::new(
            Url::parse("https://us-docker.pkg.dev").unwrap(),
            "testproject".to_string(),
            None,
            Arc::new(crate::auth_strategy::BasicAuthStrategy::new("u", "p")),
            1000,
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(c.is_gar());
        assert!(!client().is_gar());
    }
}
