//! Declarative Control Plane
//!
//! A resource-manager style control plane. Clients register provider
//! credentials, then declare resources against those registrations; the
//! control plane diffs each declaration against live state and drives a
//! pluggable provider to converge it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          REST API (axum)                             │
//! │   providerregistrations │ resources │ operationstatus │ subscriptions │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐    ┌──────────────────────────────┐    │
//! │  │ Provider Registration    │◄───│     Resource Orchestrator     │    │
//! │  │ Manager                  │    │  (diff, admit, dispatch)      │    │
//! │  └────────────┬─────────────┘    └───────┬──────────────┬────────┘    │
//! │               │                          │              │             │
//! │               │                 ┌────────┴───────┐ ┌────┴─────────┐   │
//! │               │                 │  Worker Pool   │ │  Provider    │   │
//! │               │                 │ (apply/destroy,│ │  Registry    │   │
//! │               │                 │  recovery sweep)│ │ (plugins)   │   │
//! │               │                 └────────┬───────┘ └──────────────┘   │
//! ├───────────────┴──────────────────────────┴───────────────────────────┤
//! │              Document Store (memory │ JSON files)                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestration, registration, workers and the REST API
//! - [`domain`]: identifiers, entities and the plugin/store ports
//! - [`storage`]: document store implementations
//! - [`config`]: configuration file model
//! - [`error`] and [`apierror`]: error types and the client error envelope

pub mod apierror;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use apierror::{ApiError, ErrorCategory, ErrorCode, ErrorEnvelope};

pub use config::{ControlPlaneConfig, OrchestratorConfig, ServerConfig, StorageConfig};

pub use controlplane::{
    ApiServer, ApiServerConfig, ControlPlane, ControlPlaneMetrics, ProviderRegistrationManager,
    ProviderRegistry, ResourceOrchestrator, RestRouter,
};

pub use domain::{
    DocumentStore, ProviderCapability, ProviderFactory, ProvisioningState, ResourceId,
    ResourceKind, ResourceScope,
};

pub use error::{Error, Result};

pub use storage::{open_store, FileDocumentStore, MemoryDocumentStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
