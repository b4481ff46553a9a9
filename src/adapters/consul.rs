//! Consul catalogue adapter.
//!
//! Talks to the agent HTTP API:
//! * `GET /v1/health/service/<name>` for instances with their check status
//! * `PUT /v1/agent/service/register`
//! * `PUT /v1/agent/service/deregister/<id>`
//! * `GET /v1/catalog/services`
//!
//! An instance is healthy when every one of its checks is `passing`.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    core::instance::ServiceInstance,
    ports::discovery::{DiscoveryBackend, DiscoveryError, DiscoveryResult},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthEntry {
    pub node: NodeEntry,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeEntry {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterRequest<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    meta: &'a HashMap<String, String>,
}

/// Discovery backend backed by a Consul agent
pub struct ConsulDiscovery {
    client: Client,
    base: Url,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulDiscovery {
    pub fn new(
        address: &str,
        datacenter: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(address)
            .wrap_err_with(|| format!("Invalid Consul address '{address}'"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build Consul HTTP client")?;
        tracing::info!(address, datacenter = ?datacenter, "Using Consul discovery");
        Ok(Self {
            client,
            base,
            datacenter,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> DiscoveryResult<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .map_err(|e| DiscoveryError::InvalidResponse(format!("Invalid Consul URL: {e}")))?;
        let mut builder = self.client.request(method, url);
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> DiscoveryResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("Consul request failed: {e}")))?;
        Ok(response)
    }
}

/// Convert Consul health entries into instances of `service`.
pub fn parse_health_entries(service: &str, entries: Vec<HealthEntry>) -> Vec<ServiceInstance> {
    entries
        .into_iter()
        .map(|entry| {
            let address = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            ServiceInstance {
                id: entry.service.id,
                name: service.to_string(),
                address,
                port: entry.service.port,
                tags: entry.service.tags.unwrap_or_default(),
                metadata: entry.service.meta.unwrap_or_default(),
                healthy: entry.checks.iter().all(|c| c.status == "passing"),
            }
        })
        .collect()
}

#[async_trait]
impl DiscoveryBackend for ConsulDiscovery {
    async fn fetch_instances(&self, service: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let path = format!("v1/health/service/{}", urlencoding::encode(service));
        let response = self.send(self.request(Method::GET, &path)?).await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Unavailable(format!(
                "Consul answered {} for service '{service}'",
                response.status()
            )));
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        Ok(parse_health_entries(service, entries))
    }

    async fn register(&self, instance: ServiceInstance) -> DiscoveryResult<()> {
        let body = RegisterRequest {
            id: &instance.id,
            name: &instance.name,
            tags: &instance.tags,
            address: &instance.address,
            port: instance.port,
            meta: &instance.metadata,
        };
        let response = self
            .send(self.request(Method::PUT, "v1/agent/service/register")?.json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Unavailable(format!(
                "Consul rejected registration of '{}': {}",
                instance.id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn deregister(&self, _service: &str, instance_id: &str) -> DiscoveryResult<()> {
        let path = format!(
            "v1/agent/service/deregister/{}",
            urlencoding::encode(instance_id)
        );
        let response = self.send(self.request(Method::PUT, &path)?).await?;
        // Unknown IDs are already deregistered
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(DiscoveryError::Unavailable(format!(
                "Consul rejected deregistration of '{instance_id}': {}",
                response.status()
            )))
        }
    }

    async fn list_services(&self) -> DiscoveryResult<Vec<String>> {
        let response = self
            .send(self.request(Method::GET, "v1/catalog/services")?)
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Unavailable(format!(
                "Consul answered {} for catalog listing",
                response.status()
            )));
        }
        let services: HashMap<String, Vec<String>> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        let mut names: Vec<String> = services.into_keys().collect();
        names.sort();
        Ok(names)
    }
}
