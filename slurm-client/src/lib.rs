//! Typed client for the Slurm REST API (slurmrestd).
//!
//! Only the surface the operator needs is modelled: node listing, node
//! updates (drain/undrain) and a controller ping.
//!
//! # Example
//!
//! ```no_run
//! use slurm_client::{Client, ClientOptions, Config, NodeUpdate, SlurmApi};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     Config {
//!         server: "http://slurm-restapi.slurm:6820".into(),
//!         auth_token: std::env::var("SLURM_JWT")?,
//!     },
//!     ClientOptions::default(),
//! )?;
//!
//! client.update_node("slinky-0", &NodeUpdate::drain("maintenance")).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod informer;
mod types;

pub use client::{API_VERSION, Capability, Client, ClientOptions, Config, SlurmApi, TOKEN_HEADER};
pub use error::{ClientError, Result};
pub use informer::{InformerHandle, NodeEvent, NodeInformer, diff_nodes};
pub use types::{Node, NodeBaseState, NodeState, NodeStateFlag, NodeUpdate};
