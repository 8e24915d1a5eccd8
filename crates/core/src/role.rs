//! Resolving identity role references to canonical ARNs
//!
//! A role may be specified three ways: a literal ARN, the logical name
//! of a role resource declared in the compiled template, or an intrinsic
//! attribute lookup (`Fn::GetAtt`) against a resource's live identity.

use serde_yaml::Value;
use tracing::debug;

use crate::template::CompiledTemplate;
use crate::transport::ComputeService;
use crate::{Error, Result};

/// Resource type accepted as an identity role in the template
pub const IDENTITY_ROLE_TYPE: &str = "AWS::IAM::Role";

/// The character that distinguishes a literal ARN from a logical name
const ARN_DELIMITER: char = ':';

/// One of the three ways a role may be specified in configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleReference {
    /// Already a canonical ARN; resolves to itself
    Literal(String),
    /// Logical name of a role resource in the compiled template
    LogicalName(String),
    /// `Fn::GetAtt` lookup of an attribute on a live resource
    IntrinsicAttribute { resource: String, attribute: String },
}

impl RoleReference {
    /// Classify a role specification node from the configuration tree
    pub fn from_value(value: &Value) -> Result<RoleReference> {
        match value {
            Value::String(spec) => {
                if spec.contains(ARN_DELIMITER) {
                    Ok(RoleReference::Literal(spec.clone()))
                } else {
                    Ok(RoleReference::LogicalName(spec.clone()))
                }
            }
            Value::Mapping(_) => {
                let target = value.get("Fn::GetAtt").ok_or_else(|| malformed(value))?;
                match target {
                    Value::Sequence(parts) => {
                        let resource = parts.first().and_then(Value::as_str);
                        let attribute = parts.get(1).and_then(Value::as_str);
                        match (resource, attribute) {
                            (Some(resource), Some(attribute)) => {
                                Ok(RoleReference::IntrinsicAttribute {
                                    resource: resource.to_string(),
                                    attribute: attribute.to_string(),
                                })
                            }
                            _ => Err(malformed(value)),
                        }
                    }
                    // Dotted shorthand: "LambdaRole.Arn"
                    Value::String(spec) => match spec.split_once('.') {
                        Some((resource, attribute)) => Ok(RoleReference::IntrinsicAttribute {
                            resource: resource.to_string(),
                            attribute: attribute.to_string(),
                        }),
                        None => Err(malformed(value)),
                    },
                    _ => Err(malformed(value)),
                }
            }
            _ => Err(malformed(value)),
        }
    }
}

fn malformed(value: &Value) -> Error {
    Error::InvalidConfiguration {
        message: format!(
            "unsupported role specification: {}",
            serde_yaml::to_string(value).unwrap_or_default().trim()
        ),
    }
}

/// Resolves role references against the compiled template and, for
/// intrinsic lookups, the live platform
pub struct RoleReferenceResolver<'a, C: ComputeService> {
    compute: &'a C,
    template: Option<&'a CompiledTemplate>,
    account_id: Option<&'a str>,
}

impl<'a, C: ComputeService> RoleReferenceResolver<'a, C> {
    pub fn new(
        compute: &'a C,
        template: Option<&'a CompiledTemplate>,
        account_id: Option<&'a str>,
    ) -> Self {
        Self {
            compute,
            template,
            account_id,
        }
    }

    /// Resolve a role reference to a canonical ARN
    ///
    /// Literal ARNs resolve without network access. Logical names are
    /// synthesized from the template's resource declaration and fail
    /// with [`Error::UnresolvableReference`] or
    /// [`Error::NotAnIdentityResource`]. Intrinsic lookups issue exactly
    /// one remote call; transport failures propagate unchanged.
    pub fn resolve(&self, spec: &RoleReference) -> Result<String> {
        match spec {
            RoleReference::Literal(arn) => Ok(arn.clone()),
            RoleReference::LogicalName(name) => self.synthesize(name),
            RoleReference::IntrinsicAttribute { resource, attribute } => {
                debug!("Looking up live role {}.{}", resource, attribute);
                self.compute.identity_role(resource)
            }
        }
    }

    fn synthesize(&self, logical_name: &str) -> Result<String> {
        let resource = self
            .template
            .and_then(|t| t.resource(logical_name))
            .ok_or_else(|| Error::UnresolvableReference {
                name: logical_name.to_string(),
            })?;

        let resource_type = resource.get("Type").and_then(|t| t.as_str()).unwrap_or("");
        if resource_type != IDENTITY_ROLE_TYPE {
            return Err(Error::NotAnIdentityResource {
                name: logical_name.to_string(),
                resource_type: resource_type.to_string(),
            });
        }

        let account_id = self
            .account_id
            .ok_or_else(|| Error::InvalidConfiguration {
                message: format!(
                    "cannot synthesize ARN for role '{}' without an account id",
                    logical_name
                ),
            })?;

        let properties = resource.get("Properties");
        let path = properties
            .and_then(|p| p.get("Path"))
            .and_then(|p| p.as_str())
            .unwrap_or("/");
        let role_name = properties
            .and_then(|p| p.get("RoleName"))
            .and_then(|n| n.as_str())
            .unwrap_or(logical_name);

        Ok(format!("arn:aws:iam::{}:role{}{}", account_id, path, role_name))
    }
}
