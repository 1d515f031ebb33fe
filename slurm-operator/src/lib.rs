//! Slurm Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that runs Slurm clusters:
//! slurmd worker pods, login pods and the REST clients the operator uses to
//! keep Slurm's view of its nodes in step with Kubernetes.
//!
//! # Custom Resource Definitions
//!
//! - **Controller**: A Slurm cluster (slurmctld) and its JWT signing key
//! - **RestApi**: slurmrestd for a Controller
//! - **NodeSet**: A scalable set of slurmd pods, one Slurm node per pod
//! - **LoginSet**: Login pods for a Controller
//!
//! # Example
//!
//! ```yaml
//! apiVersion: slinky.slurm.net/v1beta1
//! kind: NodeSet
//! metadata:
//!   name: cpu
//! spec:
//!   controllerRef:
//!     name: slurm
//!   replicas: 4
//!   updateStrategy:
//!     type: RollingUpdate
//!     rollingUpdate:
//!       maxUnavailable: 25%
//!   template:
//!     spec:
//!       containers:
//!         - name: slurmd
//!           image: ghcr.io/slinkyproject/slurmd:25.05
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod clientmap;
pub mod controller;
pub mod crd;
pub mod durationstore;
pub mod error;
pub mod jwt;
pub mod key;
pub mod kube_api;
pub mod labels;

#[cfg(test)]
mod testing;

pub use crd::{Controller, LoginSet, NodeSet, RestApi};
pub use error::{OperatorError, OperatorResult};
