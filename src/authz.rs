use async_trait::async_trait;
use base64::Engine;

use crate::error::{ProxyError, Result};
use crate::permissions::{Action, Permission, PermissionNode};

/// Decoded `Authorization: Basic` header (spec.md §4.7 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn from_authorization_header(value: &str) -> Result<Self> {
        let (auth_type, payload) = value
            .split_once(' ')
            .ok_or_else(|| ProxyError::MalformedCredentials("missing auth scheme".into()))?;
        if auth_type != "Basic" {
            return Err(ProxyError::MalformedCredentials(format!(
                "unexpected authentication type \"{auth_type}\""
            )));
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| ProxyError::MalformedCredentials("invalid base64 credentials payload".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| ProxyError::MalformedCredentials("credentials payload is not valid utf-8".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| ProxyError::MalformedCredentials("credentials payload missing ':' separator".into()))?;

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Collaborator seam for the external authorization service: verifies
/// caller credentials carry a given permission, and returns a caller's
/// full permission tree for catalog filtering (spec.md §4.6, §4.7).
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn check_permissions(&self, credentials: &BasicCredentials, permissions: &[Permission]) -> Result<bool>;

    async fn get_permissions_tree(&self, credentials: &BasicCredentials, root_uri: &str) -> Result<PermissionNode>;
}

/// HTTP-backed implementation: a thin client over the authorization
/// service's REST surface (`server_endpoint_url`, `service_token`).
pub struct HttpAuthorizationService {
    client: reqwest::Client,
    endpoint: url::Url,
    service_token: String,
}

impl HttpAuthorizationService {
    pub fn new(client: reqwest::Client, endpoint: url::Url, service_token: String) -> Self {
        Self {
            client,
            endpoint,
            service_token,
        }
    }
}

#[async_trait]
impl AuthorizationService for HttpAuthorizationService {
    async fn check_permissions(&self, credentials: &BasicCredentials, permissions: &[Permission]) -> Result<bool> {
        let url = self
            .endpoint
            .join(&format!("/api/v1/users/{}/permissions/check", credentials.username))
            .map_err(|e| ProxyError::UpstreamProtocol(format!("bad authorization service url: {e}")))?;

        let body: Vec<_> = permissions
            .iter()
            .map(|p| serde_json::json!({"uri": p.uri, "action": action_name(p.action)}))
            .collect();

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.service_token)
            .json(&serde_json::json!({"permissions": body}))
            .send()
            .await?;

        Ok(response.status().is_success())
    }

    async fn get_permissions_tree(&self, credentials: &BasicCredentials, root_uri: &str) -> Result<PermissionNode> {
        let url = self
            .endpoint
            .join(&format!("/api/v1/users/{}/permissions/tree", credentials.username))
            .map_err(|e| ProxyError::UpstreamProtocol(format!("bad authorization service url: {e}")))?;
        let url = {
            let mut u = url;
            u.query_pairs_mut().append_pair("uri", root_uri);
            u
        };

        let response = self.client.get(url).bearer_auth(&self.service_token).send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::UpstreamProtocol(format!(
                "authorization service returned {} for permissions tree lookup",
                response.status()
            )));
        }
        let payload: PermissionNode = response.json().await?;
        Ok(payload)
    }
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Deny => "deny",
        Action::List => "list",
        Action::Read => "read",
        Action::Write => "write",
        Action::Manage => "manage",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_basic_header() {
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("alice:s3cr3t"));
        let creds = BasicCredentials::from_authorization_header(&header).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cr3t");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        let header = "Bearer abc123";
        assert!(BasicCredentials::from_authorization_header(header).is_err());
    }

    #[test]
    fn rejects_invalid_base64() {
        let header = "Basic not-valid-base64!!!";
        assert!(BasicCredentials::from_authorization_header(header).is_err());
    }

    #[test]
    fn rejects_missing_colon_separator() {
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("nocolon"));
        assert!(BasicCredentials::from_authorization_header(&header).is_err());
    }

    #[test]
    fn password_may_contain_colons() {
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("alice:pass:word"));
        let creds = BasicCredentials::from_authorization_header(&header).unwrap();
        assert_eq!(creds.password, "pass:word");
    }
}
