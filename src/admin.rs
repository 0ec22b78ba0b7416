use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// A single organization/project a user participates in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectMembership {
    #[serde(rename = "orgName")]
    pub org_name: String,
    #[serde(rename = "projectName")]
    pub project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminUser {
    pub name: String,
    pub projects: Vec<ProjectMembership>,
}

/// Collaborator seam for the external organization/project membership
/// provider (spec.md §6, "Project-membership service").
#[async_trait]
pub trait ProjectMembershipService: Send + Sync {
    async fn get_user(&self, name: &str, include_projects: bool) -> Result<AdminUser>;
}

#[derive(Debug, Deserialize)]
struct GetUserResponse {
    name: String,
    #[serde(default)]
    projects: Vec<ProjectMembership>,
}

pub struct HttpProjectMembershipService {
    client: reqwest::Client,
    endpoint: url::Url,
    token: String,
}

impl HttpProjectMembershipService {
    pub fn new(client: reqwest::Client, endpoint: url::Url, token: String) -> Self {
        Self { client, endpoint, token }
    }
}

#[async_trait]
impl ProjectMembershipService for HttpProjectMembershipService {
    async fn get_user(&self, name: &str, include_projects: bool) -> Result<AdminUser> {
        let mut url = self
            .endpoint
            .join(&format!("/api/v1/users/{name}"))
            .map_err(|e| ProxyError::UpstreamProtocol(format!("bad admin service url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("includeProjects", if include_projects { "true" } else { "false" });

        let response = self.client.get(url).bearer_auth(&self.token).send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::NotFound(format!("admin service has no user \"{name}\"")));
        }
        let parsed: GetUserResponse = response.json().await?;
        Ok(AdminUser {
            name: parsed.name,
            projects: parsed.projects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_membership_deserializes_camel_case() {
        let json = serde_json::json!({"orgName": "acme", "projectName": "widgets"});
        let membership: ProjectMembership = serde_json::from_value(json).unwrap();
        assert_eq!(membership.org_name, "acme");
        assert_eq!(membership.project_name, "widgets");
    }

    #[test]
    fn get_user_response_defaults_projects_to_empty() {
        let json = serde_json::json!({"name": "alice"});
        let parsed: GetUserResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.name, "alice");
        assert!(parsed.projects.is_empty());
    }
}
