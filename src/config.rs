use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthServiceConfig,
    #[serde(default)]
    pub admin: Option<AdminServiceConfig>,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub events: Option<EventsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_name")]
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            name: default_server_name(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "Docker Registry".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamType {
    Basic,
    Oauth,
    AwsEcr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub project: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(rename = "type")]
    pub kind: UpstreamType,
    #[serde(default = "default_max_catalog_entries")]
    pub max_catalog_entries: usize,
    #[serde(default = "default_sock_timeout")]
    pub sock_connect_timeout_s: u64,
    #[serde(default = "default_sock_timeout")]
    pub sock_read_timeout_s: u64,
    #[serde(default)]
    pub basic: Option<BasicUpstreamConfig>,
    #[serde(default)]
    pub oauth: Option<OAuthUpstreamConfig>,
}

fn default_max_catalog_entries() -> usize {
    1000
}

fn default_sock_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicUpstreamConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthUpstreamConfig {
    pub token_url: String,
    pub token_service: String,
    pub token_username: String,
    pub token_password: String,
    #[serde(default = "default_registry_catalog_scope")]
    pub token_registry_catalog_scope: String,
    #[serde(default = "default_repository_scope_actions")]
    pub token_repository_scope_actions: String,
}

fn default_registry_catalog_scope() -> String {
    "registry:catalog:*".to_string()
}

fn default_repository_scope_actions() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthServiceConfig {
    pub server_endpoint_url: String,
    pub service_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminServiceConfig {
    pub endpoint_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `CONFIG_PATH` (default `config.toml`), matching the
    /// environment variable surface enumerated in the system's external
    /// configuration interface.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(&path)
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self.upstream.kind {
            UpstreamType::Basic => {
                if self.upstream.basic.is_none() {
                    anyhow::bail!("upstream.type = \"basic\" requires [upstream.basic]");
                }
            }
            UpstreamType::Oauth => {
                if self.upstream.oauth.is_none() {
                    anyhow::bail!("upstream.type = \"oauth\" requires [upstream.oauth]");
                }
            }
            UpstreamType::AwsEcr => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn parses_minimal_basic_config() {
        let toml = r#"
[upstream]
url = "https://private-registry.example.com"
project = "testproject"
type = "basic"

[upstream.basic]
username = "user"
password = "pass"

[auth]
server_endpoint_url = "https://auth.example.com"
service_token = "tok"

[cluster]
name = "default"
"#;
        let file = write_toml(toml);
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.max_catalog_entries, 1000);
        assert_eq!(config.upstream.kind, UpstreamType::Basic);
    }

    #[test]
    fn oauth_upstream_without_oauth_block_fails_validation() {
        let toml = r#"
[upstream]
url = "https://registry-1.docker.io"
project = "testproject"
type = "oauth"

[auth]
server_endpoint_url = "https://auth.example.com"
service_token = "tok"

[cluster]
name = "default"
"#;
        let file = write_toml(toml);
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn aws_ecr_upstream_needs_no_extra_block() {
        let toml = r#"
[upstream]
url = "https://123456789012.dkr.ecr.us-east-1.amazonaws.com"
project = "testproject"
type = "aws_ecr"

[auth]
server_endpoint_url = "https://auth.example.com"
service_token = "tok"

[cluster]
name = "default"
"#;
        let file = write_toml(toml);
        assert!(Config::from_file(file.path().to_str().unwrap()).is_ok());
    }
}
