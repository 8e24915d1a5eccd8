//! Capability traits for the remote collaborators
//!
//! The pipeline never talks to the network directly; it is handed an
//! object store and a compute service by the host. Retry, backoff and
//! timeouts are the transport's responsibility, not ours; failures
//! surface unchanged as [`Error::Transport`](crate::Error::Transport).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::reconcile::{FunctionConfigUpdate, RemoteFunctionDescriptor};

/// A listing request against the deployment bucket
#[derive(Debug, Clone)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    /// Token from the previous page; `None` for the first page
    pub continuation_token: Option<String>,
}

/// One entry returned by a listing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub key: String,
}

/// One page of listing results
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub entries: Vec<ListEntry>,
    /// True when more pages remain
    pub truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// A retrieved object with the metadata the store declared for it
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: Option<String>,
    pub content_length: i64,
    pub body: Option<Vec<u8>>,
    pub metadata: HashMap<String, String>,
}

/// Server-side encryption settings of the deployment bucket
///
/// When present, these fields are copied verbatim into per-object
/// request parameters. All fields are optional; an empty policy adds
/// nothing to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_key_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
}

impl EncryptionPolicy {
    /// Check whether any field is set
    pub fn is_empty(&self) -> bool {
        self.algorithm.is_none()
            && self.customer_key.is_none()
            && self.customer_key_digest.is_none()
            && self.kms_key_id.is_none()
    }
}

/// Object-store capability: list, get and put under the deployment bucket
pub trait ObjectStore {
    /// List one page of keys under a prefix
    fn list(&self, request: &ListRequest) -> Result<ListResponse>;

    /// Retrieve a single object, passing the bucket's encryption policy
    /// through when one is configured
    fn get(
        &self,
        bucket: &str,
        key: &str,
        encryption: Option<&EncryptionPolicy>,
    ) -> Result<StoredObject>;

    /// Store an object; acknowledgment only, no response body
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;
}

/// Remote-compute capability: read and patch one function's state
pub trait ComputeService {
    /// Current remote state of a deployed function
    fn function_configuration(&self, name: &str) -> Result<RemoteFunctionDescriptor>;

    /// Apply a sparse configuration patch
    fn update_function_configuration(&self, patch: &FunctionConfigUpdate) -> Result<()>;

    /// Replace the function's code with the given artifact bytes
    fn update_function_code(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Look up the live identity role named by a logical resource and
    /// return its canonical ARN
    fn identity_role(&self, logical_name: &str) -> Result<String>;
}
