use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix of environment overrides, e.g. `SWITCHYARD__LISTEN_ADDR`
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Load configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, chosen by extension.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let path = Path::new(config_path);
    if !path.exists() {
        eyre::bail!("Configuration file '{}' not found", path.display());
    }

    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let server_config: ServerConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    tracing::debug!(
        path = %path.display(),
        routes = server_config.routes.len(),
        "Loaded configuration"
    );
    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{DiscoveryBackendConfig, LoadBalanceStrategy, RateLimitBy};

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
discovery:
  type: static
  services:
    users:
      - id: u1
        address: 10.0.0.1
        port: 8080
      - id: u2
        address: 10.0.0.2
        port: 8080
routes:
  - service_name: users
    path_prefix: /api/users
    auth_required: true
    timeout: 2s
    retry_attempts: 2
    load_balancer: random
    rate_limit:
      requests: 100
      window: 1m
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 1);

        let route = &config.routes[0];
        assert!(route.auth_required);
        assert_eq!(route.retry_attempts, 2);
        assert_eq!(route.load_balancer, LoadBalanceStrategy::Random);
        let rate_limit = route.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.requests, 100);
        assert_eq!(rate_limit.by, RateLimitBy::Ip);

        match &config.discovery {
            DiscoveryBackendConfig::Static { services } => {
                assert_eq!(services["users"].len(), 2);
                assert!(services["users"][0].healthy);
            }
            other => panic!("unexpected discovery backend: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "discovery": {"type": "consul", "address": "http://127.0.0.1:8500", "datacenter": "dc1"},
  "routes": [
    {"service_name": "orders", "path_prefix": "/orders"}
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes[0].timeout, "30s");
        assert_eq!(config.routes[0].retry_attempts, 3);
        assert!(matches!(
            config.discovery,
            DiscoveryBackendConfig::Consul { ref datacenter, .. } if datacenter.as_deref() == Some("dc1")
        ));
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "0.0.0.0:8080"

[circuit_breaker]
failure_threshold = 3
cooldown = "10s"

[[routes]]
service_name = "echo"
path_prefix = "/echo"
strip_prefix = true
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 1);
        assert!(config.routes[0].strip_prefix);
    }

    #[tokio::test]
    async fn test_missing_file() {
        assert!(load_config("/definitely/not/here.yaml").await.is_err());
    }
}
