//! Google Cloud provider for Groundwork
//!
//! This crate implements the Groundwork resource controllers for Google
//! Compute Engine. Provider calls go over the compute v1 JSON REST API
//! with Bearer token authentication; long-running operations are absorbed
//! inside the transport so controllers see synchronous calls.
//!
//! # Features
//!
//! - Instance provisioning with deployment labels and attached disks
//! - Configuration-agent handoff once an instance reaches RUNNING
//! - Cleanup sweeps for instances and non-auto-delete disks
//!
//! # Example
//!
//! ```ignore
//! use groundwork_cloud::collaborators::Credentials;
//! use groundwork_cloud::session::{DeployContext, Services};
//! use groundwork_cloud_gcp::InstanceController;
//!
//! let services = Services::new(DeployContext::new("demo-1234"));
//! let creds = Credentials::new().with("access_token", token);
//! let controller = InstanceController::new(services, "my-project", "us-central1-a", &creds)?;
//! ```

pub mod error;
pub mod instance;
pub mod rest;

pub use error::classify_status;
pub use instance::InstanceController;
pub use rest::ComputeRest;
