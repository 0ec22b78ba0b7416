use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_ecr::Client as EcrClient;
use base64::Engine;
use serde_json::{json, Value};

use crate::cache::ExpiringCache;
use crate::error::{ProxyError, Result};

const EXPIRATION_RATIO: f64 = 0.75;
const DEFAULT_EXPIRES_IN_S: u64 = 60;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Scoped upstream credential header provider. Implementations cache
/// tokens until expiry; concurrent callers may race and refetch, which
/// is an accepted cost (spec.md §5).
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn get_headers(&self, scopes: &[String]) -> Result<HashMap<String, String>>;

    /// Idempotent repo creation. No-op for strategies whose upstream
    /// doesn't require pre-provisioned repos.
    async fn create_repo(&self, _repo: &str) -> Result<()> {
        Ok(())
    }
}

fn scope_key(scopes: &[String]) -> Option<String> {
    if scopes.is_empty() {
        None
    } else {
        Some(scopes.join(" "))
    }
}

/// Returns a constant `Authorization: Basic` header. No cache — there is
/// nothing to expire.
pub struct BasicAuthStrategy {
    username: String,
    password: String,
}

impl BasicAuthStrategy {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header(&self) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

#[async_trait]
impl AuthStrategy for BasicAuthStrategy {
    async fn get_headers(&self, _scopes: &[String]) -> Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), self.header());
        Ok(headers)
    }
}

/// `(access_token, expires_at)` where `expires_at = issued_at + expires_in
/// * 0.75`, per spec.md §3.
#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub expires_in: Duration,
}

impl OAuthToken {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let access_token = payload
            .get("token")
            .or_else(|| payload.get("access_token"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::UpstreamProtocol("OAuth response missing access token".into()))?
            .to_string();

        let expires_in_s = payload
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_EXPIRES_IN_S);

        let issued_at = payload
            .get("issued_at")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp() as f64)
            .unwrap_or_else(now_unix);

        let expires_at = issued_at + expires_in_s as f64 * EXPIRATION_RATIO;
        let remaining = (expires_at - now_unix()).max(0.0);

        Ok(Self {
            access_token,
            expires_in: Duration::from_secs_f64(remaining),
        })
    }
}

pub struct OAuthStrategy {
    client: reqwest::Client,
    token_url: url::Url,
    service: String,
    username: String,
    password: String,
    catalog_scope: String,
    repo_scope_actions: String,
    cache: ExpiringCache<HashMap<String, String>>,
}

impl OAuthStrategy {
    pub fn new(
        client: reqwest::Client,
        token_url: url::Url,
        service: String,
        username: String,
        password: String,
        catalog_scope: String,
        repo_scope_actions: String,
    ) -> Self {
        Self {
            client,
            token_url,
            service,
            username,
            password,
            catalog_scope,
            repo_scope_actions,
            cache: ExpiringCache::new(),
        }
    }

    pub fn catalog_scopes(&self) -> Vec<String> {
        vec![self.catalog_scope.clone()]
    }

    pub fn repo_scopes(&self, repo: &str, mounted_repo: Option<&str>) -> Vec<String> {
        let mut scopes = vec![format!("repository:{repo}:{}", self.repo_scope_actions)];
        if let Some(mounted) = mounted_repo {
            scopes.push(format!("repository:{mounted}:{}", self.repo_scope_actions));
        }
        scopes
    }

    async fn fetch_token(&self, scopes: &[String]) -> Result<OAuthToken> {
        let mut url = self.token_url.clone();
        url.query_pairs_mut().append_pair("service", &self.service);
        for scope in scopes {
            url.query_pairs_mut().append_pair("scope", scope);
        }

        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let payload: Value = response.json().await?;
        OAuthToken::from_payload(&payload)
    }
}

#[async_trait]
impl AuthStrategy for OAuthStrategy {
    async fn get_headers(&self, scopes: &[String]) -> Result<HashMap<String, String>> {
        let key = scope_key(scopes);
        if let Some(headers) = self.cache.get(&key) {
            return Ok(headers);
        }
        let token = self.fetch_token(scopes).await?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token.access_token));
        self.cache.put(key, headers.clone(), token.expires_in);
        Ok(headers)
    }
}

/// AWS ECR authorization token: already `base64(user:pass)`, so the
/// upstream header is `Authorization: Basic {token}`.
#[derive(Debug, Clone)]
pub struct AWSECRAuthToken {
    pub token: String,
    pub expires_in: Duration,
}

impl AWSECRAuthToken {
    pub fn from_sdk_response(
        response: &aws_sdk_ecr::operation::get_authorization_token::GetAuthorizationTokenOutput,
    ) -> Result<Self> {
        let data = response
            .authorization_data()
            .first()
            .ok_or_else(|| ProxyError::UpstreamProtocol("ECR returned no authorization data".into()))?;
        let token = data
            .authorization_token()
            .ok_or_else(|| ProxyError::UpstreamProtocol("ECR authorization data missing token".into()))?
            .to_string();
        let expires_at_ts = data
            .expires_at()
            .ok_or_else(|| ProxyError::UpstreamProtocol("ECR authorization data missing expiry".into()))?
            .secs() as f64;

        let issued_at = now_unix();
        if expires_at_ts <= issued_at {
            return Err(ProxyError::UpstreamProtocol("ECR token already expired".into()));
        }
        let expires_in_s = (expires_at_ts - issued_at) * EXPIRATION_RATIO;

        Ok(Self {
            token,
            expires_in: Duration::from_secs_f64(expires_in_s),
        })
    }
}

/// A single `*` cache key is used for all scopes: ECR auth is global per
/// account, not scoped per repository.
pub struct AwsEcrAuthStrategy {
    client: EcrClient,
    cache: ExpiringCache<HashMap<String, String>>,
}

impl AwsEcrAuthStrategy {
    pub fn new(client: EcrClient) -> Self {
        Self {
            client,
            cache: ExpiringCache::new(),
        }
    }

    pub fn client(&self) -> &EcrClient {
        &self.client
    }

    async fn fetch_token(&self) -> Result<AWSECRAuthToken> {
        let response = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamProtocol(format!("ECR GetAuthorizationToken failed: {e}")))?;
        AWSECRAuthToken::from_sdk_response(&response)
    }
}

#[async_trait]
impl AuthStrategy for AwsEcrAuthStrategy {
    async fn get_headers(&self, _scopes: &[String]) -> Result<HashMap<String, String>> {
        let key = Some("*".to_string());
        if let Some(headers) = self.cache.get(&key) {
            return Ok(headers);
        }
        let token = self.fetch_token().await?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Basic {}", token.token));
        self.cache.put(key, headers.clone(), token.expires_in);
        Ok(headers)
    }

    async fn create_repo(&self, repo: &str) -> Result<()> {
        match self.client.create_repository().repository_name(repo).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.as_service_error()
                    .map(|se| se.is_repository_already_exists_exception())
                    .unwrap_or(false)
                {
                    Ok(())
                } else {
                    Err(ProxyError::UpstreamProtocol(format!("ECR CreateRepository failed: {e}")))
                }
            }
        }
    }
}

/// Translates an ECR `BatchDeleteImage` failure array into a Docker
/// Registry v2 error envelope (spec.md §4.4).
pub fn convert_ecr_failure(failure_code: &str, failure_reason: &str) -> (u16, Value) {
    match failure_code {
        "ImageNotFound" => (
            404,
            json!({"errors": [{"code": "NAME_INVALID", "message": "Invalid image name", "detail": failure_reason}]}),
        ),
        "RepositoryNotFound" => (
            404,
            json!({"errors": [{"code": "NAME_UNKNOWN", "message": "Repository name not known to registry", "detail": failure_reason}]}),
        ),
        other => (
            500,
            json!({"errors": [{"code": 0, "message": other, "detail": failure_reason}]}),
        ),
    }
}
