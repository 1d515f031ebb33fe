//! Unit tests for slurm-client construction and errors.

use slurm_client::{Capability, Client, ClientError, ClientOptions, Config, SlurmApi};
use std::time::Duration;

fn config(server: &str) -> Config {
    Config {
        server: server.to_string(),
        auth_token: String::new(),
    }
}

#[test]
fn test_client_creation() {
    let client = Client::new(config("http://localhost:6820"), ClientOptions::default());
    assert!(client.is_ok());
}

#[test]
fn test_client_with_timeout() {
    let client = Client::new(
        config("http://localhost:6820"),
        ClientOptions {
            timeout: Duration::from_secs(60),
            ..Default::default()
        },
    );
    assert!(client.is_ok());
}

#[test]
fn test_invalid_url() {
    let client = Client::new(config("slurm-restapi:6820"), ClientOptions::default());
    assert!(matches!(client, Err(ClientError::InvalidUrl(_))));
}

#[test]
fn test_https_urls() {
    let client = Client::new(config("https://secure.example.com"), ClientOptions::default());
    assert!(client.is_ok());
}

#[test]
fn test_error_display() {
    let error = ClientError::InvalidUrl("test error".to_string());
    let display = format!("{}", error);
    assert!(display.contains("Invalid URL"));
    assert!(display.contains("test error"));
}

#[test]
fn test_api_error_display() {
    let error = ClientError::Api {
        status: 404,
        message: "Not found".to_string(),
    };

    let display = format!("{}", error);
    assert!(display.contains("404"));
    assert!(display.contains("Not found"));
}

#[tokio::test]
async fn test_disabled_nodes_capability() {
    let client = Client::new(
        config("http://localhost:6820"),
        ClientOptions {
            disable_for: vec![Capability::Nodes],
            ..Default::default()
        },
    )
    .unwrap();

    assert!(matches!(
        client.list_nodes().await,
        Err(ClientError::Disabled(Capability::Nodes))
    ));
}
