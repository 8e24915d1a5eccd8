//! Typed desired-state model extracted from a resolved document
//!
//! Configuration values may still contain unresolved intrinsic
//! expressions (mappings such as `{Ref: ...}` or `{Fn::ImportValue: ...}`)
//! after reference resolution. Those must never be forwarded verbatim to
//! the platform, so every field is loaded as a [`Desired`] value and the
//! reconciler handles each tag explicitly.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::document::Document;
use crate::role::RoleReference;
use crate::transport::EncryptionPolicy;
use crate::{Error, Result};

/// A desired configuration value that may not be concrete yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired<T> {
    /// A concrete scalar value, safe to send to the platform
    Concrete(T),
    /// A structured placeholder (unresolved intrinsic expression)
    Placeholder,
    /// Not specified at this level
    Absent,
}

impl<T> Desired<T> {
    pub fn is_concrete(&self) -> bool {
        matches!(self, Desired::Concrete(_))
    }

    pub fn as_concrete(&self) -> Option<&T> {
        match self {
            Desired::Concrete(value) => Some(value),
            _ => None,
        }
    }

    /// Function-level value wins; the fallback applies only when this
    /// level says nothing at all. A placeholder is "specified but not
    /// usable" and deliberately does not fall through.
    pub fn or(self, fallback: Desired<T>) -> Desired<T> {
        match self {
            Desired::Absent => fallback,
            specified => specified,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Desired::Concrete(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> Default for Desired<T> {
    fn default() -> Self {
        Desired::Absent
    }
}

/// Provider-level defaults applying to every function
#[derive(Debug, Clone, Default)]
pub struct ProviderDefaults {
    pub region: Option<String>,
    pub deployment_bucket: Option<String>,
    pub encryption: EncryptionPolicy,
    pub account_id: Option<String>,
    pub description: Desired<String>,
    pub memory_size: Desired<i64>,
    pub timeout: Desired<i64>,
    pub kms_key: Desired<String>,
    pub environment: BTreeMap<String, Desired<String>>,
    pub security_group_ids: Desired<Vec<String>>,
    pub subnet_ids: Desired<Vec<String>>,
    pub role: Option<RoleReference>,
}

/// Desired configuration of a single function
#[derive(Debug, Clone, Default)]
pub struct FunctionConfig {
    /// Deployed function name
    pub name: String,
    pub description: Desired<String>,
    pub memory_size: Desired<i64>,
    pub timeout: Desired<i64>,
    pub kms_key: Desired<String>,
    /// Included in a patch only when set at function level
    pub dead_letter_target: Desired<String>,
    pub environment: BTreeMap<String, Desired<String>>,
    pub security_group_ids: Desired<Vec<String>>,
    pub subnet_ids: Desired<Vec<String>>,
    pub role: Option<RoleReference>,
}

/// The whole resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: String,
    pub stage: String,
    pub provider: ProviderDefaults,
    pub functions: BTreeMap<String, FunctionConfig>,
}

impl ServiceConfig {
    /// Extract the typed model from a resolved document tree
    ///
    /// `stage_override` takes precedence over the document's
    /// `provider.stage`; the stage defaults to `dev` when neither is set.
    pub fn from_document(doc: &Document, stage_override: Option<&str>) -> Result<Self> {
        let service = doc
            .get("service")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidConfiguration {
                message: "missing top-level 'service' name".to_string(),
            })?
            .to_string();

        let provider_node = doc.get("provider");
        let stage = stage_override
            .map(str::to_string)
            .or_else(|| {
                provider_node
                    .and_then(|p| p.get("stage"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "dev".to_string());

        let provider = parse_provider(provider_node)?;

        let mut functions = BTreeMap::new();
        if let Some(mapping) = doc.get("functions").and_then(Value::as_mapping) {
            for (key, node) in mapping {
                let logical = key.as_str().ok_or_else(|| Error::InvalidConfiguration {
                    message: "function keys must be strings".to_string(),
                })?;
                let function = parse_function(logical, node, &service, &stage)?;
                functions.insert(logical.to_string(), function);
            }
        }

        Ok(ServiceConfig {
            service,
            stage,
            provider,
            functions,
        })
    }
}

fn parse_provider(node: Option<&Value>) -> Result<ProviderDefaults> {
    let Some(node) = node else {
        return Ok(ProviderDefaults::default());
    };

    let vpc = node.get("vpc");

    Ok(ProviderDefaults {
        region: node.get("region").and_then(Value::as_str).map(str::to_string),
        deployment_bucket: bucket_name(node),
        encryption: bucket_encryption(node),
        account_id: node
            .get("accountId")
            .and_then(Value::as_str)
            .map(str::to_string),
        description: desired_string(node.get("description")),
        memory_size: desired_int(node.get("memorySize")),
        timeout: desired_int(node.get("timeout")),
        kms_key: desired_string(node.get("kmsKeyArn")),
        environment: desired_environment(node.get("environment")),
        security_group_ids: desired_string_list(vpc.and_then(|v| v.get("securityGroupIds"))),
        subnet_ids: desired_string_list(vpc.and_then(|v| v.get("subnetIds"))),
        role: node.get("role").map(RoleReference::from_value).transpose()?,
    })
}

fn parse_function(logical: &str, node: &Value, service: &str, stage: &str) -> Result<FunctionConfig> {
    let name = node
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}-{}", service, stage, logical));

    let vpc = node.get("vpc");

    Ok(FunctionConfig {
        name,
        description: desired_string(node.get("description")),
        memory_size: desired_int(node.get("memorySize")),
        timeout: desired_int(node.get("timeout")),
        kms_key: desired_string(node.get("kmsKeyArn")),
        dead_letter_target: desired_string(node.get("onError")),
        environment: desired_environment(node.get("environment")),
        security_group_ids: desired_string_list(vpc.and_then(|v| v.get("securityGroupIds"))),
        subnet_ids: desired_string_list(vpc.and_then(|v| v.get("subnetIds"))),
        role: node.get("role").map(RoleReference::from_value).transpose()?,
    })
}

fn bucket_name(provider: &Value) -> Option<String> {
    match provider.get("deploymentBucket") {
        Some(Value::String(name)) => Some(name.clone()),
        Some(Value::Mapping(_)) => provider
            .get("deploymentBucket")
            .and_then(|b| b.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn bucket_encryption(provider: &Value) -> EncryptionPolicy {
    let Some(bucket) = provider.get("deploymentBucket") else {
        return EncryptionPolicy::default();
    };
    let field = |key: &str| bucket.get(key).and_then(Value::as_str).map(str::to_string);
    EncryptionPolicy {
        algorithm: field("serverSideEncryption"),
        customer_key: field("sseCustomerKey"),
        customer_key_digest: field("sseCustomerKeyMD5"),
        kms_key_id: field("sseKMSKeyId"),
    }
}

/// Scalar → concrete, mapping/sequence → placeholder, missing → absent
fn desired_string(node: Option<&Value>) -> Desired<String> {
    match node {
        None | Some(Value::Null) => Desired::Absent,
        Some(Value::String(s)) => Desired::Concrete(s.clone()),
        Some(Value::Bool(b)) => Desired::Concrete(b.to_string()),
        Some(Value::Number(n)) => Desired::Concrete(n.to_string()),
        Some(_) => Desired::Placeholder,
    }
}

fn desired_int(node: Option<&Value>) -> Desired<i64> {
    match node {
        None | Some(Value::Null) => Desired::Absent,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Desired::Concrete(i),
            None => Desired::Placeholder,
        },
        Some(_) => Desired::Placeholder,
    }
}

/// A list is concrete only when every element is a scalar string
fn desired_string_list(node: Option<&Value>) -> Desired<Vec<String>> {
    match node {
        None | Some(Value::Null) => Desired::Absent,
        Some(Value::Sequence(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Desired::Placeholder,
                }
            }
            Desired::Concrete(out)
        }
        Some(_) => Desired::Placeholder,
    }
}

fn desired_environment(node: Option<&Value>) -> BTreeMap<String, Desired<String>> {
    let mut env = BTreeMap::new();
    if let Some(mapping) = node.and_then(Value::as_mapping) {
        for (key, value) in mapping {
            if let Some(key) = key.as_str() {
                env.insert(key.to_string(), desired_string(Some(value)));
            }
        }
    }
    env
}
