use url::Url;

use crate::error::{ProxyError, Result};
use crate::repo_url::RepoURL;

/// Composes upstream/registry URLs and rewrites `Location` headers.
/// Stateless given its constructor inputs.
#[derive(Debug, Clone)]
pub struct URLFactory {
    registry_endpoint: Url,
    upstream_endpoint: Url,
    upstream_project: String,
    upstream_repo: Option<String>,
}

impl URLFactory {
    pub fn new(
        registry_endpoint: Url,
        upstream_endpoint: Url,
        upstream_project: String,
        upstream_repo: Option<String>,
    ) -> Self {
        Self {
            registry_endpoint,
            upstream_endpoint,
            upstream_project,
            upstream_repo,
        }
    }

    pub fn upstream_project(&self) -> &str {
        &self.upstream_project
    }

    pub fn upstream_repo(&self) -> Option<&str> {
        self.upstream_repo.as_deref()
    }

    pub fn create_registry_version_check_url(&self) -> Url {
        let mut url = self.upstream_endpoint.clone();
        url.set_path("/v2/");
        url
    }

    pub fn create_upstream_catalog_url(&self, query: &str) -> Url {
        let mut url = self.upstream_endpoint.clone();
        url.set_path("/v2/_catalog");
        url.set_query(if query.is_empty() { None } else { Some(query) });
        url
    }

    pub fn create_registry_catalog_url(&self, query: &str) -> Url {
        let mut url = self.registry_endpoint.clone();
        url.set_path("/v2/_catalog");
        url.set_query(if query.is_empty() { None } else { Some(query) });
        url
    }

    /// Translates a registry-facing RepoURL into its upstream
    /// equivalent. Passthrough URLs only have their origin rebased.
    pub fn create_upstream_repo_url(&self, r: &RepoURL) -> RepoURL {
        if r.allow_skip_perms {
            return r.with_origin(&self.upstream_endpoint);
        }
        r.with_project(&self.upstream_project, self.upstream_repo.as_deref())
            .with_origin(&self.upstream_endpoint)
    }

    /// Inverse of `create_upstream_repo_url`: strips the configured
    /// project (and repo, if configured) prefix and rebases onto the
    /// registry origin. Fails if the upstream repo doesn't carry the
    /// expected prefix.
    pub fn create_registry_repo_url(&self, u: &RepoURL) -> Result<RepoURL> {
        if u.allow_skip_perms {
            return Ok(u.with_origin(&self.registry_endpoint));
        }
        let prefix = match &self.upstream_repo {
            Some(repo) if !repo.is_empty() => format!("{}/{}", self.upstream_project, repo),
            _ => self.upstream_project.clone(),
        };
        let full_prefix = format!("{prefix}/");
        let stripped = u.repo.strip_prefix(&full_prefix).ok_or_else(|| {
            ProxyError::UpstreamProtocol(format!(
                "upstream repo \"{}\" does not start with configured project prefix \"{}\"",
                u.repo, prefix
            ))
        })?;
        Ok(u.with_repo(stripped).with_origin(&self.registry_endpoint))
    }

    /// `Location` header rewriting rule: if the header's host is neither
    /// the upstream host nor the registry host, it is a third-party
    /// redirect (e.g. an S3 presigned URL) and is returned unchanged.
    pub fn rewrite_location(&self, location: &str) -> Result<String> {
        let location_url = match Url::parse(location) {
            Ok(u) => u,
            Err(_) => return Ok(location.to_string()),
        };

        let is_upstream_host = location_url.host_str() == self.upstream_endpoint.host_str();
        let is_registry_host = location_url.host_str() == self.registry_endpoint.host_str();
        if !is_upstream_host && !is_registry_host {
            return Ok(location.to_string());
        }

        let repo_url = RepoURL::from_url(&location_url)?;
        if repo_url.allow_skip_perms {
            return Ok(location.to_string());
        }
        let registry_url = self.create_registry_repo_url(&repo_url)?;
        Ok(registry_url.url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn factory() -> URLFactory {
        URLFactory::new(
            Url::parse("https://registry.local").unwrap(),
            Url::parse("https://upstream.example").unwrap(),
            "testproject".to_string(),
            None,
        )
    }

    #[test]
    fn round_trip_repo_url() {
        let f = factory();
        let r = RepoURL::from_url(&Url::parse("https://registry.local/v2/alice/foo/tags/list").unwrap())
            .unwrap();
        let upstream = f.create_upstream_repo_url(&r);
        assert_eq!(upstream.repo, "testproject/alice/foo");

        let back = f.create_registry_repo_url(&upstream).unwrap();
        assert_eq!(back.repo, r.repo);
        assert_eq!(back.url.path(), r.url.path());
    }

    #[test]
    fn create_registry_repo_url_rejects_mismatched_project() {
        let f = factory();
        let r = RepoURL::from_url(&Url::parse("https://upstream.example/v2/otherproject/foo/tags/list").unwrap())
            .unwrap();
        assert!(f.create_registry_repo_url(&r).is_err());
    }

    #[test]
    fn location_rewrite_preserves_third_party_host() {
        let f = factory();
        let s3 = "https://bucket.s3.amazonaws.com/some/presigned?X-Amz-Signature=abc";
        assert_eq!(f.rewrite_location(s3).unwrap(), s3);
    }

    #[test]
    fn location_rewrite_converts_upstream_host() {
        let f = factory();
        let loc = "https://upstream.example/v2/testproject/alice/foo/blobs/uploads/xyz";
        let rewritten = f.rewrite_location(loc).unwrap();
        assert!(rewritten.starts_with("https://registry.local/v2/alice/foo/blobs/uploads/xyz"));
    }

    #[test]
    fn passthrough_skip_perms_only_rebases_origin() {
        let f = factory();
        let r = RepoURL::from_url(
            &Url::parse("https://registry.local/v2/proj/repo/pkg/blobs/sha256:aa").unwrap(),
        )
        .unwrap();
        let upstream = f.create_upstream_repo_url(&r);
        assert_eq!(upstream.url.path(), r.url.path());
        assert_eq!(upstream.url.host_str(), Some("upstream.example"));
    }

    #[test]
    fn query_is_preserved_through_catalog_url() {
        let f = factory();
        let url = f.create_upstream_catalog_url("n=10&last=abc");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("n").map(String::as_str), Some("10"));
        assert_eq!(pairs.get("last").map(String::as_str), Some("abc"));
    }
}
