//! Computing and submitting the minimal configuration patch
//!
//! Reconciliation compares the desired configuration (function level
//! winning over provider defaults) with the function's current remote
//! state and produces a sparse patch. Local validation happens before
//! any network call; an empty patch results in no remote call at all.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Desired, FunctionConfig, ProviderDefaults};
use crate::role::RoleReferenceResolver;
use crate::transport::ComputeService;
use crate::{Error, Result};

/// Network placement of a function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

impl VpcConfig {
    pub fn is_empty(&self) -> bool {
        self.security_group_ids.is_empty() && self.subnet_ids.is_empty()
    }
}

/// Current remote state of a deployed function, owned by the platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteFunctionDescriptor {
    pub name: String,
    /// Base64-rendered SHA-256 of the deployed code
    pub code_hash: String,
    pub description: Option<String>,
    pub memory_size: Option<i64>,
    pub timeout: Option<i64>,
    pub role: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub vpc_config: Option<VpcConfig>,
    pub dead_letter_target: Option<String>,
    pub kms_key_ref: Option<String>,
}

/// Sparse configuration patch; fields left `None` are not touched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfigUpdate {
    pub function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_config: Option<VpcConfig>,
}

impl FunctionConfigUpdate {
    /// True when the patch carries nothing beyond the identifying name
    pub fn is_noop(&self) -> bool {
        self.description.is_none()
            && self.memory_size.is_none()
            && self.timeout.is_none()
            && self.role.is_none()
            && self.kms_key_arn.is_none()
            && self.dead_letter_arn.is_none()
            && self.environment.is_none()
            && self.vpc_config.is_none()
    }
}

/// Outcome of submitting a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Patch was empty; no remote call was made
    NoOp,
    /// One update call was issued and acknowledged
    Updated,
}

/// Compute the minimal patch for one function
///
/// Environment keys are validated locally and fail with
/// [`Error::InvalidEnvironmentKey`] before any network call. Role
/// resolution runs last and is the only step that may reach the network.
pub fn reconcile<C: ComputeService>(
    function: &FunctionConfig,
    provider: &ProviderDefaults,
    remote: Option<&RemoteFunctionDescriptor>,
    resolver: &RoleReferenceResolver<'_, C>,
) -> Result<FunctionConfigUpdate> {
    let environment = merge_environment(function, provider, remote)?;

    let mut update = FunctionConfigUpdate {
        function_name: function.name.clone(),
        description: pick(
            &function.description,
            &provider.description,
            remote.and_then(|r| r.description.as_ref()),
        ),
        memory_size: pick(
            &function.memory_size,
            &provider.memory_size,
            remote.and_then(|r| r.memory_size.as_ref()),
        ),
        timeout: pick(
            &function.timeout,
            &provider.timeout,
            remote.and_then(|r| r.timeout.as_ref()),
        ),
        kms_key_arn: pick(
            &function.kms_key,
            &provider.kms_key,
            remote.and_then(|r| r.kms_key_ref.as_ref()),
        ),
        // Dead-letter targets are honored only when set on the function
        dead_letter_arn: pick(
            &function.dead_letter_target,
            &Desired::Absent,
            remote.and_then(|r| r.dead_letter_target.as_ref()),
        ),
        environment,
        vpc_config: merge_vpc(function, provider, remote),
        role: None,
    };

    let desired_role = function.role.as_ref().or(provider.role.as_ref());
    if let Some(spec) = desired_role {
        let arn = resolver.resolve(spec)?;
        let current = remote.and_then(|r| r.role.as_deref());
        if current != Some(arn.as_str()) {
            update.role = Some(arn);
        }
    }

    Ok(update)
}

/// Issue the update call unless the patch is empty
pub fn submit<C: ComputeService>(
    compute: &C,
    update: &FunctionConfigUpdate,
) -> Result<ReconcileOutcome> {
    if update.is_noop() {
        info!(
            "Configuration of {} already matches; nothing to update",
            update.function_name
        );
        return Ok(ReconcileOutcome::NoOp);
    }

    compute.update_function_configuration(update)?;
    info!("Updated configuration of {}", update.function_name);
    Ok(ReconcileOutcome::Updated)
}

/// Resolve one scalar field: function level wins, provider default
/// applies only when the function says nothing, placeholders drop the
/// field, and a value equal to the remote one is omitted
fn pick<T: Clone + PartialEq>(
    function_level: &Desired<T>,
    provider_level: &Desired<T>,
    current: Option<&T>,
) -> Option<T> {
    match function_level.clone().or(provider_level.clone()) {
        Desired::Concrete(value) => {
            if current == Some(&value) {
                None
            } else {
                Some(value)
            }
        }
        Desired::Placeholder | Desired::Absent => None,
    }
}

/// Merge provider and function environments (function wins on key
/// collision), validate every concrete key, and drop the whole field
/// when any merged value is still a placeholder
fn merge_environment(
    function: &FunctionConfig,
    provider: &ProviderDefaults,
    remote: Option<&RemoteFunctionDescriptor>,
) -> Result<Option<BTreeMap<String, String>>> {
    let mut merged: BTreeMap<&str, &Desired<String>> = BTreeMap::new();
    for (key, value) in &provider.environment {
        merged.insert(key, value);
    }
    for (key, value) in &function.environment {
        merged.insert(key, value);
    }

    if merged.is_empty() {
        return Ok(None);
    }

    for key in merged.keys() {
        if !valid_env_key(key) {
            return Err(Error::InvalidEnvironmentKey {
                key: (*key).to_string(),
            });
        }
    }

    let mut concrete = BTreeMap::new();
    for (key, value) in merged {
        match value {
            Desired::Concrete(value) => {
                concrete.insert(key.to_string(), value.clone());
            }
            // The platform cannot apply partially-resolved values
            Desired::Placeholder => {
                debug!("Environment contains an unresolved value; skipping environment update");
                return Ok(None);
            }
            Desired::Absent => {}
        }
    }

    if remote.is_some_and(|r| r.environment == concrete) {
        return Ok(None);
    }
    Ok(Some(concrete))
}

/// Environment keys must start with a letter or underscore and contain
/// only letters, digits and underscores
fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Network placement is patched only when both lists are concrete and
/// the merged object is non-empty
fn merge_vpc(
    function: &FunctionConfig,
    provider: &ProviderDefaults,
    remote: Option<&RemoteFunctionDescriptor>,
) -> Option<VpcConfig> {
    let groups = function
        .security_group_ids
        .clone()
        .or(provider.security_group_ids.clone());
    let subnets = function.subnet_ids.clone().or(provider.subnet_ids.clone());

    let (Desired::Concrete(security_group_ids), Desired::Concrete(subnet_ids)) = (groups, subnets)
    else {
        return None;
    };

    let vpc = VpcConfig {
        security_group_ids,
        subnet_ids,
    };
    if vpc.is_empty() {
        return None;
    }
    if remote.and_then(|r| r.vpc_config.as_ref()) == Some(&vpc) {
        return None;
    }
    Some(vpc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct RecordingCompute {
        config_updates: Cell<u32>,
        role_lookups: Cell<u32>,
    }

    impl ComputeService for RecordingCompute {
        fn function_configuration(&self, _: &str) -> Result<RemoteFunctionDescriptor> {
            panic!("not used by these tests")
        }

        fn update_function_configuration(&self, _: &FunctionConfigUpdate) -> Result<()> {
            self.config_updates.set(self.config_updates.get() + 1);
            Ok(())
        }

        fn update_function_code(&self, _: &str, _: Vec<u8>) -> Result<()> {
            panic!("not used by these tests")
        }

        fn identity_role(&self, name: &str) -> Result<String> {
            self.role_lookups.set(self.role_lookups.get() + 1);
            Ok(format!("arn:aws:iam::123456789012:role/{}", name))
        }
    }

    fn concrete_env(pairs: &[(&str, &str)]) -> BTreeMap<String, Desired<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Desired::Concrete(v.to_string())))
            .collect()
    }

    fn function(name: &str) -> FunctionConfig {
        FunctionConfig {
            name: name.to_string(),
            ..FunctionConfig::default()
        }
    }

    #[test]
    fn test_environment_merge_function_wins() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.environment = concrete_env(&[("A", "1")]);
        let provider = ProviderDefaults {
            environment: concrete_env(&[("B", "2"), ("A", "x")]),
            ..ProviderDefaults::default()
        };

        let update = reconcile(&f, &provider, None, &resolver).unwrap();
        let env = update.environment.unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "2");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_placeholder_drops_whole_environment() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.environment = concrete_env(&[("A", "1")]);
        f.environment
            .insert("TABLE".to_string(), Desired::Placeholder);

        let update = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap();
        assert!(update.environment.is_none());
    }

    #[test]
    fn test_invalid_key_fails_before_any_network_call() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.environment = concrete_env(&[("1BAD", "x")]);
        // A role that would require a remote lookup if reached
        f.role = Some(crate::role::RoleReference::IntrinsicAttribute {
            resource: "LambdaRole".to_string(),
            attribute: "Arn".to_string(),
        });

        let err = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironmentKey { .. }));
        assert_eq!(compute.role_lookups.get(), 0);
    }

    #[test]
    fn test_noop_when_remote_matches() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.memory_size = Desired::Concrete(512);
        f.timeout = Desired::Concrete(30);
        f.environment = concrete_env(&[("STAGE", "dev")]);
        f.role = Some(crate::role::RoleReference::Literal(
            "arn:aws:iam::123456789012:role/live".to_string(),
        ));

        let remote = RemoteFunctionDescriptor {
            name: "demo-dev-hello".to_string(),
            memory_size: Some(512),
            timeout: Some(30),
            role: Some("arn:aws:iam::123456789012:role/live".to_string()),
            environment: [("STAGE".to_string(), "dev".to_string())].into(),
            ..RemoteFunctionDescriptor::default()
        };

        let update = reconcile(&f, &ProviderDefaults::default(), Some(&remote), &resolver).unwrap();
        assert!(update.is_noop());

        let outcome = submit(&compute, &update).unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoOp);
        assert_eq!(compute.config_updates.get(), 0);
    }

    #[test]
    fn test_changed_fields_are_patched() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.memory_size = Desired::Concrete(1024);
        f.timeout = Desired::Absent;
        let provider = ProviderDefaults {
            timeout: Desired::Concrete(60),
            ..ProviderDefaults::default()
        };

        let remote = RemoteFunctionDescriptor {
            name: "demo-dev-hello".to_string(),
            memory_size: Some(512),
            timeout: Some(60),
            ..RemoteFunctionDescriptor::default()
        };

        let update = reconcile(&f, &provider, Some(&remote), &resolver).unwrap();
        assert_eq!(update.memory_size, Some(1024));
        // Provider timeout matches the remote value, so it is omitted
        assert_eq!(update.timeout, None);

        let outcome = submit(&compute, &update).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(compute.config_updates.get(), 1);
    }

    #[test]
    fn test_provider_description_default_applies() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let f = function("demo-dev-hello");
        let provider = ProviderDefaults {
            description: Desired::Concrete("from provider".to_string()),
            ..ProviderDefaults::default()
        };

        let update = reconcile(&f, &provider, None, &resolver).unwrap();
        assert_eq!(update.description.as_deref(), Some("from provider"));

        // A function-level description still wins over the default
        let mut f = function("demo-dev-hello");
        f.description = Desired::Concrete("from function".to_string());
        let update = reconcile(&f, &provider, None, &resolver).unwrap();
        assert_eq!(update.description.as_deref(), Some("from function"));
    }

    #[test]
    fn test_dead_letter_only_from_function_level() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let f = function("demo-dev-hello");
        let provider = ProviderDefaults::default();
        let update = reconcile(&f, &provider, None, &resolver).unwrap();
        assert_eq!(update.dead_letter_arn, None);

        let mut f = function("demo-dev-hello");
        f.dead_letter_target = Desired::Concrete("arn:aws:sqs:us-east-1:1:dlq".to_string());
        let update = reconcile(&f, &provider, None, &resolver).unwrap();
        assert_eq!(
            update.dead_letter_arn.as_deref(),
            Some("arn:aws:sqs:us-east-1:1:dlq")
        );
    }

    #[test]
    fn test_vpc_requires_both_concrete_lists() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.security_group_ids = Desired::Concrete(vec!["sg-1".to_string()]);
        let update = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap();
        assert!(update.vpc_config.is_none());

        f.subnet_ids = Desired::Concrete(vec!["subnet-1".to_string()]);
        let update = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap();
        assert_eq!(
            update.vpc_config,
            Some(VpcConfig {
                security_group_ids: vec!["sg-1".to_string()],
                subnet_ids: vec!["subnet-1".to_string()],
            })
        );

        f.subnet_ids = Desired::Placeholder;
        let update = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap();
        assert!(update.vpc_config.is_none());
    }

    #[test]
    fn test_role_resolution_included_when_changed() {
        let compute = RecordingCompute::default();
        let resolver = RoleReferenceResolver::new(&compute, None, None);

        let mut f = function("demo-dev-hello");
        f.role = Some(crate::role::RoleReference::IntrinsicAttribute {
            resource: "LambdaRole".to_string(),
            attribute: "Arn".to_string(),
        });

        let update = reconcile(&f, &ProviderDefaults::default(), None, &resolver).unwrap();
        assert_eq!(
            update.role.as_deref(),
            Some("arn:aws:iam::123456789012:role/LambdaRole")
        );
        assert_eq!(compute.role_lookups.get(), 1);
    }

    #[test]
    fn test_valid_env_key_pattern() {
        assert!(valid_env_key("PATH"));
        assert!(valid_env_key("_private"));
        assert!(valid_env_key("TABLE_2"));
        assert!(!valid_env_key("1BAD"));
        assert!(!valid_env_key(""));
        assert!(!valid_env_key("WITH-DASH"));
    }
}
