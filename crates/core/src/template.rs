//! Fetching and integrity-checking the stored compiled template

use tracing::{debug, info};

use crate::locate::DeploymentRecord;
use crate::transport::{EncryptionPolicy, ObjectStore};
use crate::{Error, Result};

/// Object name of the compiled template inside a deployment directory
pub const COMPILED_TEMPLATE_OBJECT: &str = "compiled-cloudformation-template.json";

/// Content type the stored template must declare
const EXPECTED_CONTENT_TYPE: &str = "application/json";

/// Metadata key carrying the fingerprint recorded at upload time
const FINGERPRINT_METADATA_KEY: &str = "filesha256";

/// A retrieved and validated compiled template
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    /// Parsed template document
    pub template: serde_json::Value,
    /// Fingerprint recorded as object metadata at upload time; empty
    /// when the object carries none. Advisory, used for audit logging.
    pub content_hash: String,
}

impl CompiledTemplate {
    /// Look up a resource declaration by logical id
    pub fn resource(&self, logical_id: &str) -> Option<&serde_json::Value> {
        self.template.get("Resources")?.get(logical_id)
    }
}

/// Fetches one template object and validates it before parsing
pub struct TemplateIntegrityFetcher<'a, S: ObjectStore> {
    store: &'a S,
    bucket: &'a str,
    encryption: Option<&'a EncryptionPolicy>,
}

impl<'a, S: ObjectStore> TemplateIntegrityFetcher<'a, S> {
    pub fn new(store: &'a S, bucket: &'a str, encryption: Option<&'a EncryptionPolicy>) -> Self {
        Self {
            store,
            bucket,
            encryption,
        }
    }

    /// Fetch the compiled template stored under a deployment directory
    ///
    /// Fails with [`Error::Integrity`] unless the object declares the
    /// expected content type, a strictly positive size and a body, and
    /// with [`Error::MalformedTemplate`] when the body is not valid
    /// JSON. Transport failures propagate for the caller's retry policy.
    pub fn fetch(&self, deployment: &DeploymentRecord) -> Result<CompiledTemplate> {
        let key = format!("{}/{}", deployment.directory, COMPILED_TEMPLATE_OBJECT);
        debug!("Fetching compiled template {}", key);

        let object = self.store.get(self.bucket, &key, self.encryption)?;

        let content_type = object.content_type.as_deref().unwrap_or("");
        if content_type != EXPECTED_CONTENT_TYPE {
            return Err(Error::Integrity {
                key,
                message: format!(
                    "expected content type '{}', got '{}'",
                    EXPECTED_CONTENT_TYPE, content_type
                ),
            });
        }
        if object.content_length <= 0 {
            return Err(Error::Integrity {
                key,
                message: format!("non-positive content length {}", object.content_length),
            });
        }
        let Some(body) = object.body else {
            return Err(Error::Integrity {
                key,
                message: "response carried no body".to_string(),
            });
        };

        let text = String::from_utf8_lossy(&body);
        let template: serde_json::Value =
            serde_json::from_str(&text).map_err(|source| Error::MalformedTemplate {
                key: key.clone(),
                source,
            })?;

        let content_hash = object
            .metadata
            .get(FINGERPRINT_METADATA_KEY)
            .cloned()
            .unwrap_or_default();

        info!(
            "Validated template {} (fingerprint: {})",
            key,
            if content_hash.is_empty() { "none" } else { &content_hash }
        );

        Ok(CompiledTemplate {
            template,
            content_hash,
        })
    }
}
