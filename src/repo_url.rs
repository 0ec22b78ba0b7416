use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::{ProxyError, Result};

fn standard_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/v2/(?P<repo>.+)/(?P<suffix>(?:tags|manifests|blobs)/.*)$").unwrap()
    })
}

fn passthrough_uploads_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^/(?:artifacts-uploads|artifacts-downloads)/namespaces/[^/]+/repositories/[^/]+/(?:uploads|downloads)/.+$",
        )
        .unwrap()
    })
}

fn passthrough_pkg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/v2/[^/]+/[^/]+/pkg/blobs/.*$").unwrap())
}

/// Parsed, immutable view of a Docker Registry v2 request URL: its repo
/// name, an optional cross-repo mount source (`from=`), and whether it
/// matched a passthrough grammar that must bypass permission checks and
/// project-prefix rewriting entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoURL {
    pub repo: String,
    pub mounted_repo: Option<String>,
    pub url: Url,
    pub allow_skip_perms: bool,
    suffix: Option<String>,
}

impl RepoURL {
    /// Parses `url` against the passthrough grammars first, then the
    /// standard `/v2/{repo}/{suffix}` grammar. Fails with
    /// `InvalidRegistryPath` if neither matches.
    pub fn from_url(url: &Url) -> Result<Self> {
        let path = url.path();

        if passthrough_uploads_re().is_match(path) || passthrough_pkg_re().is_match(path) {
            return Ok(Self {
                repo: String::new(),
                mounted_repo: None,
                url: url.clone(),
                allow_skip_perms: true,
                suffix: None,
            });
        }

        let caps = standard_path_re().captures(path).ok_or_else(|| {
            ProxyError::InvalidRequest(format!("unexpected path in a registry URL: {path}"))
        })?;
        let repo = caps["repo"].to_string();
        let suffix = caps["suffix"].to_string();

        let mounted_repo = if suffix.starts_with("blobs/uploads") {
            url.query_pairs()
                .find(|(k, _)| k == "from")
                .map(|(_, v)| v.into_owned())
        } else {
            None
        };

        Ok(Self {
            repo,
            mounted_repo,
            url: url.clone(),
            allow_skip_perms: false,
            suffix: Some(suffix),
        })
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    fn rebuild_path(&self, repo: &str) -> String {
        format!("/v2/{}/{}", repo, self.suffix.as_deref().unwrap_or(""))
    }

    /// Prefixes `repo` (and the mounted repo, if any) with
    /// `project[/upstream_repo]`. No-op for passthrough URLs — callers
    /// must check `allow_skip_perms` first per spec.
    pub fn with_project(&self, project: &str, upstream_repo: Option<&str>) -> Self {
        if self.allow_skip_perms {
            return self.clone();
        }
        let prefix = match upstream_repo {
            Some(r) if !r.is_empty() => format!("{project}/{r}"),
            _ => project.to_string(),
        };
        let new_repo = format!("{prefix}/{}", self.repo);
        let mut next = self.with_repo(&new_repo);
        if let Some(mounted) = &self.mounted_repo {
            let new_mounted = format!("{prefix}/{mounted}");
            next = next.with_query_pair("from", &new_mounted);
            next.mounted_repo = Some(new_mounted);
        }
        next
    }

    /// Replaces only the `repo` path segment, preserving the suffix and
    /// query string.
    pub fn with_repo(&self, new_repo: &str) -> Self {
        let mut url = self.url.clone();
        url.set_path(&self.rebuild_path(new_repo));
        Self {
            repo: new_repo.to_string(),
            mounted_repo: self.mounted_repo.clone(),
            url,
            allow_skip_perms: self.allow_skip_perms,
            suffix: self.suffix.clone(),
        }
    }

    /// Rebases scheme/host/port onto `origin`, keeping path and query.
    pub fn with_origin(&self, origin: &Url) -> Self {
        let mut url = origin.clone();
        url.set_path(self.url.path());
        url.set_query(self.url.query());
        Self {
            repo: self.repo.clone(),
            mounted_repo: self.mounted_repo.clone(),
            url,
            allow_skip_perms: self.allow_skip_perms,
            suffix: self.suffix.clone(),
        }
    }

    /// Merges `extra` into the existing query string, overwriting keys
    /// that already appear.
    pub fn with_query(&self, extra: &HashMap<String, String>) -> Self {
        let mut merged: HashMap<String, String> = self
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        merged.extend(extra.clone());

        let mut url = self.url.clone();
        if merged.is_empty() {
            url.set_query(None);
        } else {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (k, v) in &merged {
                pairs.append_pair(k, v);
            }
            drop(pairs);
        }
        Self {
            repo: self.repo.clone(),
            mounted_repo: self.mounted_repo.clone(),
            url,
            allow_skip_perms: self.allow_skip_perms,
            suffix: self.suffix.clone(),
        }
    }

    fn with_query_pair(&self, key: &str, value: &str) -> Self {
        let mut extra = HashMap::new();
        extra.insert(key.to_string(), value.to_string());
        self.with_query(&extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn parses_standard_path_greedily_on_repo() {
        let r = RepoURL::from_url(&u("https://registry.example/v2/a/b/tags/list")).unwrap();
        assert_eq!(r.repo, "a/b");
        assert!(!r.allow_skip_perms);
    }

    #[test]
    fn cross_repo_mount_captures_from_query() {
        let r = RepoURL::from_url(&u(
            "https://registry.example/v2/alice/img/blobs/uploads/?from=alice/other",
        ))
        .unwrap();
        assert_eq!(r.mounted_repo.as_deref(), Some("alice/other"));
    }

    #[test]
    fn passthrough_artifacts_uploads_skips_perms() {
        let r = RepoURL::from_url(&u(
            "https://registry.example/artifacts-uploads/namespaces/proj/repositories/repo/uploads/123",
        ))
        .unwrap();
        assert!(r.allow_skip_perms);
    }

    #[test]
    fn passthrough_pkg_blobs_skips_perms() {
        let r = RepoURL::from_url(&u("https://registry.example/v2/proj/repo/pkg/blobs/sha256:abc"))
            .unwrap();
        assert!(r.allow_skip_perms);
    }

    #[test]
    fn invalid_path_fails() {
        assert!(RepoURL::from_url(&u("https://registry.example/not-v2/x")).is_err());
    }

    #[test]
    fn round_trip_with_project_and_back() {
        let registry_origin = u("https://registry.local");
        let upstream_origin = u("https://upstream.example");

        let original = RepoURL::from_url(&u("https://registry.local/v2/alice/foo/tags/list")).unwrap();
        let upstream = original
            .with_project("testproject", None)
            .with_origin(&upstream_origin);
        assert_eq!(upstream.repo, "testproject/alice/foo");
        assert_eq!(upstream.url.host_str(), Some("upstream.example"));

        let (project, rest) = upstream.repo.split_once('/').unwrap();
        assert_eq!(project, "testproject");
        let back = upstream.with_repo(rest).with_origin(&registry_origin);
        assert_eq!(back.repo, original.repo);
        assert_eq!(back.url.path(), original.url.path());
    }

    #[test]
    fn with_query_preserves_other_params() {
        let r = RepoURL::from_url(&u("https://registry.local/v2/a/tags/list?n=10")).unwrap();
        let mut extra = HashMap::new();
        extra.insert("last".to_string(), "cursor".to_string());
        let merged = r.with_query(&extra);
        let pairs: HashMap<_, _> = merged.url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("n").map(String::as_str), Some("10"));
        assert_eq!(pairs.get("last").map(String::as_str), Some("cursor"));
    }

    #[test]
    fn with_project_prefixes_mounted_repo_too() {
        let r = RepoURL::from_url(&u(
            "https://registry.local/v2/alice/img/blobs/uploads/?from=alice/other",
        ))
        .unwrap();
        let upstream = r.with_project("testproject", None);
        assert_eq!(upstream.mounted_repo.as_deref(), Some("testproject/alice/other"));
        let pairs: HashMap<_, _> = upstream.url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("from").map(String::as_str), Some("testproject/alice/other"));
    }
}
