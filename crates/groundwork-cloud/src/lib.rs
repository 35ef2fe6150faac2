//! Groundwork Cloud Provisioning Core
//!
//! This crate is the provider-independent heart of Groundwork: it turns
//! declarative resource descriptors into live cloud resources and tears
//! them down again, across provider crates that plug in underneath.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 deployment session               │
//! │   (DeployContext, Ledger, ResourceLocks)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               groundwork-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │        Scheduler + ResourceController     │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │   Endpoint   │  │    Ledger    │            │
//! │  │ (retry/backoff)│ │ (deployment  │            │
//! │  │              │  │   record)     │            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │ groundwork-   │ │ groundwork-   │
//! │ cloud-aws     │ │ cloud-gcp     │
//! └───────────────┘ └───────────────┘
//! ```
//!
//! Provider crates implement [`ProviderApi`] (the raw call surface) and
//! [`ResourceController`] (lifecycle per resource kind); everything above
//! those traits lives here.

pub mod api;
pub mod collaborators;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod ledger;
pub mod mock;
pub mod poll;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod tags;

// Re-exports
pub use api::{ApiError, ErrorClass, ProviderApi};
pub use collaborators::{
    ConfigAgent, CredentialStore, Credentials, DnsRegistrar, NodeHandle, NoopAgent, NoopDns,
    StaticCredentialStore,
};
pub use controller::{FindCriteria, ResourceController};
pub use endpoint::{BackoffPolicy, Endpoint, EndpointRegistry};
pub use error::{CloudError, Result};
pub use ledger::{Ledger, LedgerData, LedgerEntry, LedgerStore};
pub use poll::{wait_for, PollOutcome, PollPolicy};
pub use resource::{
    Capabilities, CleanupOptions, CleanupReport, Dependency, PhysicalResource, ResourceDescriptor,
    ResourceKind, ResourceStatus,
};
pub use scheduler::{DepState, DeployOutcome, Scheduler};
pub use session::{DeployContext, ResourceLocks, Services};
pub use tags::{
    matches_deployment, matches_name_fallback, standard_tags, Tag, TAG_DEPLOY_ID, TAG_MASTER_IP,
    TAG_NAME,
};
