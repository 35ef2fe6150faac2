//! AWS provider for Groundwork
//!
//! This crate implements the Groundwork resource controllers for AWS,
//! covering CloudFormation stacks, classic load balancers, and RDS
//! databases. Provider calls go through the `aws` CLI in JSON mode.
//!
//! # Features
//!
//! - CloudFormation stack orchestration with sub-resource adoption
//! - Classic ELB provisioning (listeners, health checks, stickiness)
//! - RDS lifecycle including snapshot restore and read replicas
//!
//! # Requirements
//!
//! - `aws` CLI must be installed and configured
//! - Authentication is managed through the AWS CLI credential chain
//!
//! # Example
//!
//! ```ignore
//! use groundwork_cloud::session::{DeployContext, Services};
//! use groundwork_cloud_aws::DatabaseController;
//!
//! let services = Services::new(DeployContext::new("demo-1234"));
//! let controller = DatabaseController::new(services, "us-east-1");
//! ```

pub mod cli;
pub mod database;
pub mod error;
pub mod loadbalancer;
pub mod stack;

pub use cli::AwsCli;
pub use database::DatabaseController;
pub use error::{classify, parse_cli_error};
pub use loadbalancer::LoadBalancerController;
pub use stack::StackController;
