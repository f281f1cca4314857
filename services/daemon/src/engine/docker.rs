//! Docker Engine API client.
//!
//! Speaks plain HTTP/1.1 to the Docker daemon, either over its unix socket
//! or over TCP. Only the handful of endpoints the daemon needs are wrapped.
//!
//! Reference: https://docs.docker.com/engine/api/v1.38/

use std::collections::HashMap;

use async_trait::async_trait;
use dync_registry::Node;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::form_urlencoded;

use super::{Engine, EngineError, NodeSpec};

/// Docker API version the daemon pins.
const API_VERSION: &str = "v1.38";

/// Label carrying the owning cluster ID on every node container.
pub const CLUSTER_LABEL: &str = "com.dyncluster.cluster-id";

enum Transport {
    Unix {
        socket_path: String,
        client: Client<UnixConnector>,
    },
    Tcp {
        base_url: String,
        client: Client<HttpConnector>,
    },
}

/// Docker Engine API client.
pub struct DockerEngine {
    transport: Transport,
}

impl DockerEngine {
    /// Create a client for a Docker host.
    ///
    /// Accepts a socket path (`/var/run/docker.sock`), a `unix://` URL, or a
    /// `tcp://host:port` / `http://host:port` address. No connection is made
    /// until the first request; call [`Engine::ping`] to verify reachability.
    pub fn connect(host: &str) -> Result<Self, EngineError> {
        let transport = if let Some(path) = host.strip_prefix("unix://") {
            Transport::Unix {
                socket_path: path.to_string(),
                client: Client::unix(),
            }
        } else if host.starts_with('/') {
            Transport::Unix {
                socket_path: host.to_string(),
                client: Client::unix(),
            }
        } else if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            if addr.is_empty() {
                return Err(EngineError::InvalidHost(host.to_string()));
            }
            Transport::Tcp {
                base_url: format!("http://{}", addr.trim_end_matches('/')),
                client: Client::new(),
            }
        } else {
            return Err(EngineError::InvalidHost(host.to_string()));
        };

        Ok(Self { transport })
    }

    fn uri(&self, path: &str) -> Result<hyper::Uri, EngineError> {
        let path = format!("/{API_VERSION}{path}");
        match &self.transport {
            Transport::Unix { socket_path, .. } => Ok(hyperlocal::Uri::new(socket_path, &path).into()),
            Transport::Tcp { base_url, .. } => format!("{base_url}{path}")
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| EngineError::InvalidHost(e.to_string())),
        }
    }

    /// Send a request and return the status with the full response body.
    async fn send<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<(StatusCode, hyper::body::Bytes), EngineError> {
        let uri = self.uri(path)?;

        debug!(method = %method, path = path, "Request to engine API");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = match &self.transport {
            Transport::Unix { client, .. } => client.request(request).await?,
            Transport::Tcp { client, .. } => client.request(request).await?,
        };
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        Ok((status, bytes))
    }

    /// Send a request and fail on any non-success status.
    async fn call<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<hyper::body::Bytes, EngineError> {
        let (status, bytes) = self.send(method, path, body).await?;
        if status.is_success() {
            Ok(bytes)
        } else {
            Err(api_error(status, &bytes))
        }
    }

    async fn start_and_inspect(&self, container_id: &str, spec: &NodeSpec) -> Result<Node, EngineError> {
        self.call::<()>(Method::POST, &format!("/containers/{container_id}/start"), None)
            .await?;

        let bytes = self
            .call::<()>(Method::GET, &format!("/containers/{container_id}/json"), None)
            .await?;
        let inspect: ContainerInspect = serde_json::from_slice(&bytes)?;

        let ipv4_address = inspect
            .network_settings
            .networks
            .get(&spec.network)
            .map(|n| n.ip_address.clone())
            .unwrap_or_default();

        Ok(Node {
            container_id: container_id.to_string(),
            name: spec.name.clone(),
            initial_server_version: spec.server_version.clone(),
            ipv4_address,
        })
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> EngineError {
    let message = serde_json::from_slice::<ErrorMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
    error!(status = %status, message = %message, "Engine API error");
    EngineError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.call::<()>(Method::GET, "/_ping", None).await?;
        Ok(())
    }

    async fn has_network(&self, name: &str) -> Result<bool, EngineError> {
        let bytes = self.call::<()>(Method::GET, "/networks", None).await?;
        let networks: Vec<NetworkSummary> = serde_json::from_slice(&bytes)?;
        Ok(networks.iter().any(|n| n.name == name))
    }

    async fn registry_login(&self, server: &str) -> Result<(), EngineError> {
        let auth = AuthConfig {
            server_address: server.to_string(),
        };
        self.call(Method::POST, "/auth", Some(&auth)).await?;
        Ok(())
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<Node, EngineError> {
        let mut labels = HashMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), spec.cluster_id.clone());

        let create = CreateContainer {
            image: spec.image.clone(),
            hostname: spec.name.clone(),
            labels,
            host_config: HostConfig {
                network_mode: spec.network.clone(),
            },
        };

        let name: String = form_urlencoded::byte_serialize(spec.name.as_bytes()).collect();
        let bytes = self
            .call(
                Method::POST,
                &format!("/containers/create?name={name}"),
                Some(&create),
            )
            .await?;
        let created: CreatedContainer = serde_json::from_slice(&bytes)?;

        match self.start_and_inspect(&created.id, spec).await {
            Ok(node) => Ok(node),
            Err(e) => {
                // Don't leave a created-but-unusable container behind.
                if let Err(cleanup) = self.remove_container(&created.id).await {
                    warn!(
                        container_id = %created.id,
                        error = %cleanup,
                        "Failed to remove container after failed start"
                    );
                }
                Err(e)
            }
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let (status, bytes) = self
            .send::<()>(
                Method::DELETE,
                &format!("/containers/{container_id}?force=true&v=true"),
                None,
            )
            .await?;

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(EngineError::ContainerNotFound(container_id.to_string())),
            s => Err(api_error(s, &bytes)),
        }
    }
}

impl From<hyper::http::Error> for EngineError {
    fn from(err: hyper::http::Error) -> Self {
        EngineError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Serialize)]
struct AuthConfig {
    #[serde(rename = "serveraddress")]
    server_address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainer {
    image: String,
    hostname: String,
    labels: HashMap<String, String>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    network_mode: String,
}

#[derive(Debug, Deserialize)]
struct CreatedContainer {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}
