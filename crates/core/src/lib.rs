//! slipway-core: reconciliation of a deployable unit with its remote state
//!
//! This crate locates the most recent prior deployment in an object
//! store, fetches and integrity-checks the stored compiled template,
//! resolves identity role references, computes the minimal remote
//! configuration patch, and gates artifact re-upload on a content-hash
//! comparison. Cloud transport is injected through the capability
//! traits in [`transport`]; this crate never retries or signs requests.

pub mod artifact;
pub mod config;
pub mod document;
mod error;
pub mod locate;
pub mod pipeline;
pub mod reconcile;
pub mod role;
pub mod template;
pub mod transport;

pub use error::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

pub use artifact::{ArchiveTarget, ArtifactDescriptor, SyncOutcome};
pub use config::{Desired, FunctionConfig, ProviderDefaults, ServiceConfig};
pub use document::{Document, load};
pub use locate::{DeploymentLocator, DeploymentRecord, deployment_prefix};
pub use pipeline::{Pipeline, PipelineReport, PipelineState, RunOptions};
pub use reconcile::{
    FunctionConfigUpdate, ReconcileOutcome, RemoteFunctionDescriptor, VpcConfig, reconcile, submit,
};
pub use role::{RoleReference, RoleReferenceResolver};
pub use template::{CompiledTemplate, TemplateIntegrityFetcher};
pub use transport::{ComputeService, EncryptionPolicy, ObjectStore};
