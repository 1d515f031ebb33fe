//! Core Slurm REST client implementation.

use crate::error::{ClientError, Result};
use crate::types::{Node, NodeUpdate, NodesResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Version of the slurmrestd OpenAPI plugin this client speaks.
pub const API_VERSION: &str = "v0.0.43";

/// Header carrying the Slurm JWT.
pub const TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";

/// Client operations that can be switched off at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// `GET /slurm/<version>/ping`.
    ControllerPing,
    /// Node reads and updates.
    Nodes,
}

/// Connection settings for a client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of slurmrestd, e.g. `http://slurm-restapi.slurm:6820`.
    pub server: String,
    /// Slurm JWT sent with every request.
    pub auth_token: String,
}

/// Optional behaviour for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Capabilities that return [`ClientError::Disabled`] instead of calling out.
    pub disable_for: Vec<Capability>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            disable_for: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Operations the operator needs from a Slurm cluster.
///
/// Server address and token are interior-mutable so a shared handle can be
/// refreshed in place.
#[async_trait]
pub trait SlurmApi: Send + Sync {
    /// Current server URL.
    fn server(&self) -> String;

    /// Point the client at a new server. An invalid URL leaves the current
    /// server in place.
    fn set_server(&self, server: String) -> Result<()>;

    /// Replace the auth token.
    fn set_token(&self, token: String);

    /// List every node known to slurmctld.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Get a single node by name.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Update node state and reason.
    async fn update_node(&self, name: &str, update: &NodeUpdate) -> Result<()>;

    /// Check that slurmctld answers.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug)]
struct Endpoint {
    server: String,
    token: String,
}

/// A client for slurmrestd.
///
/// # Example
///
/// ```no_run
/// use slurm_client::{Client, ClientOptions, Config, SlurmApi};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(
///     Config {
///         server: "http://localhost:6820".into(),
///         auth_token: "token".into(),
///     },
///     ClientOptions::default(),
/// )?;
///
/// for node in client.list_nodes().await? {
///     println!("{} {:?}", node.name, node.state);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    endpoint: RwLock<Endpoint>,
    http: HttpClient,
    disabled: Vec<Capability>,
}

impl Client {
    /// Create a new Slurm client.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(config: Config, options: ClientOptions) -> Result<Self> {
        validate_server(&config.server)?;

        let http = HttpClient::builder().timeout(options.timeout).build()?;

        Ok(Self {
            endpoint: RwLock::new(Endpoint {
                server: config.server,
                token: config.auth_token,
            }),
            http,
            disabled: options.disable_for,
        })
    }

    /// Whether a capability was disabled at construction.
    pub fn is_disabled(&self, capability: Capability) -> bool {
        self.disabled.contains(&capability)
    }

    fn check(&self, capability: Capability) -> Result<()> {
        if self.is_disabled(capability) {
            Err(ClientError::Disabled(capability))
        } else {
            Ok(())
        }
    }

    /// Build a full URL from a path below the versioned API root.
    fn url(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        let endpoint = self.endpoint.read();
        format!(
            "{}/slurm/{}/{}",
            endpoint.server.trim_end_matches('/'),
            API_VERSION,
            path
        )
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.endpoint.read().token.clone();
        if token.is_empty() {
            builder
        } else {
            builder.header(TOKEN_HEADER, token)
        }
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        self.with_auth(self.http.get(&url))
            .send()
            .await
            .map_err(ClientError::Http)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response> {
        let url = self.url(path);
        self.with_auth(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(ClientError::Http)
    }

    /// Handle a response and deserialize JSON.
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        // slurmrestd reports failures as {"errors": [{"description": ...}]}
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|json| {
                json["errors"][0]["description"]
                    .as_str()
                    .or_else(|| json["errors"][0]["error"].as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body);

        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn validate_server(server: &str) -> Result<()> {
    if !server.starts_with("http://") && !server.starts_with("https://") {
        return Err(ClientError::InvalidUrl(format!(
            "URL must start with http:// or https://, got: {}",
            server
        )));
    }
    Ok(())
}

#[async_trait]
impl SlurmApi for Client {
    fn server(&self) -> String {
        self.endpoint.read().server.clone()
    }

    fn set_server(&self, server: String) -> Result<()> {
        validate_server(&server)?;
        self.endpoint.write().server = server;
        Ok(())
    }

    fn set_token(&self, token: String) {
        self.endpoint.write().token = token;
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.check(Capability::Nodes)?;
        let response = self.get("nodes").await?;
        let nodes: NodesResponse = self.handle_response(response).await?;
        Ok(nodes.nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.check(Capability::Nodes)?;
        let response = self.get(&format!("node/{}", name)).await?;
        let nodes: NodesResponse = self.handle_response(response).await?;
        nodes
            .nodes
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ClientError::NotFound {
                kind: "Node",
                name: name.to_string(),
            })
    }

    async fn update_node(&self, name: &str, update: &NodeUpdate) -> Result<()> {
        self.check(Capability::Nodes)?;
        tracing::debug!(node = %name, state = ?update.state, "Updating Slurm node");
        let response = self.post_json(&format!("node/{}", name), update).await?;
        let _: serde_json::Value = self.handle_response(response).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check(Capability::ControllerPing)?;
        let response = self.get("ping").await?;
        let _: serde_json::Value = self.handle_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &str) -> Result<Client> {
        Client::new(
            Config {
                server: server.to_string(),
                auth_token: "token".to_string(),
            },
            ClientOptions::default(),
        )
    }

    #[test]
    fn test_client_invalid_url() {
        assert!(matches!(
            client("localhost:6820"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_url_building() {
        let client = client("http://localhost:6820/").unwrap();
        assert_eq!(
            client.url("nodes"),
            "http://localhost:6820/slurm/v0.0.43/nodes"
        );
        assert_eq!(
            client.url("/node/n1"),
            "http://localhost:6820/slurm/v0.0.43/node/n1"
        );
    }

    #[test]
    fn test_set_server_in_place() {
        let client = client("http://localhost:6820").unwrap();
        client
            .set_server("http://slurm-restapi.slurm:6820".to_string())
            .unwrap();
        assert_eq!(client.server(), "http://slurm-restapi.slurm:6820");

        assert!(matches!(
            client.set_server("not-a-url".to_string()),
            Err(ClientError::InvalidUrl(_))
        ));
        assert_eq!(client.server(), "http://slurm-restapi.slurm:6820");
    }

    #[tokio::test]
    async fn test_disabled_ping() {
        let client = Client::new(
            Config {
                server: "http://localhost:6820".to_string(),
                auth_token: String::new(),
            },
            ClientOptions {
                disable_for: vec![Capability::ControllerPing],
                ..Default::default()
            },
        )
        .unwrap();

        assert!(client.is_disabled(Capability::ControllerPing));
        assert!(matches!(
            client.ping().await,
            Err(ClientError::Disabled(Capability::ControllerPing))
        ));
    }
}
