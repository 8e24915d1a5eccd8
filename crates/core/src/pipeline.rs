//! End-to-end reconciliation run
//!
//! One pipeline instance owns one run for a single service and stage.
//! Stages run strictly in sequence; the deployment record located first
//! is cached on the run and read by the template fetch. Every stage's
//! outcome is an explicit value handed to the next stage, and a failure
//! moves the run to `Failed` without compensating for remote changes
//! already acknowledged by the platform.

use std::path::Path;

use tracing::{debug, info};

use crate::artifact::{ArchiveTarget, ArtifactDescriptor, SyncOutcome, sync};
use crate::config::ServiceConfig;
use crate::locate::{DeploymentLocator, DeploymentRecord, deployment_prefix};
use crate::reconcile::{ReconcileOutcome, reconcile, submit};
use crate::role::RoleReferenceResolver;
use crate::template::{CompiledTemplate, TemplateIntegrityFetcher};
use crate::transport::{ComputeService, ObjectStore};
use crate::{Error, Result};

/// Where a run currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    LocatingDeployment,
    FetchingTemplate,
    ResolvingRole,
    ReconcilingConfig,
    SyncingArtifact,
    Done,
    Failed(String),
}

/// Options for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Upload the artifact even when the content hash matches
    pub force_upload: bool,
}

/// What a completed run did
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub deployment: DeploymentRecord,
    /// Advisory fingerprint recorded with the stored template
    pub template_hash: String,
    pub config: ReconcileOutcome,
    pub sync: SyncOutcome,
}

/// A single reconciliation run for one service and stage
///
/// Must not be shared across concurrent runs for different targets; the
/// cached deployment record belongs to this run alone.
pub struct Pipeline<'a, S: ObjectStore, C: ComputeService> {
    store: &'a S,
    compute: &'a C,
    config: &'a ServiceConfig,
    state: PipelineState,
    deployment: Option<DeploymentRecord>,
}

impl<'a, S: ObjectStore, C: ComputeService> Pipeline<'a, S, C> {
    pub fn new(store: &'a S, compute: &'a C, config: &'a ServiceConfig) -> Self {
        Self {
            store,
            compute,
            config,
            state: PipelineState::Idle,
            deployment: None,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Run the full pipeline for one function
    ///
    /// Local validation (missing artifact, unknown function, missing
    /// deployment bucket) fails before any remote call. Any stage
    /// failure moves the run to [`PipelineState::Failed`] and surfaces
    /// the error unchanged.
    pub fn run(
        &mut self,
        function_key: &str,
        artifact_path: &Path,
        options: RunOptions,
    ) -> Result<PipelineReport> {
        match self.execute(function_key, artifact_path, options) {
            Ok(report) => {
                self.state = PipelineState::Done;
                Ok(report)
            }
            Err(error) => {
                self.state = PipelineState::Failed(error.to_string());
                Err(error)
            }
        }
    }

    fn execute(
        &mut self,
        function_key: &str,
        artifact_path: &Path,
        options: RunOptions,
    ) -> Result<PipelineReport> {
        let function =
            self.config
                .functions
                .get(function_key)
                .ok_or_else(|| Error::InvalidConfiguration {
                    message: format!("function '{}' is not defined", function_key),
                })?;
        let bucket = self
            .config
            .provider
            .deployment_bucket
            .as_deref()
            .ok_or_else(|| Error::InvalidConfiguration {
                message: "no deployment bucket configured".to_string(),
            })?;

        // Fingerprint before touching the network
        let artifact = ArtifactDescriptor::from_path(artifact_path)?;

        self.transition(PipelineState::LocatingDeployment);
        let prefix = deployment_prefix(&self.config.service, &self.config.stage);
        let locator = DeploymentLocator::new(self.store, bucket);
        // Cached on the run; the template fetch below reads it from here
        let deployment = self.deployment.insert(locator.locate(&prefix)?).clone();

        self.transition(PipelineState::FetchingTemplate);
        let encryption = (!self.config.provider.encryption.is_empty())
            .then_some(&self.config.provider.encryption);
        let fetcher = TemplateIntegrityFetcher::new(self.store, bucket, encryption);
        let template: CompiledTemplate = fetcher.fetch(&deployment)?;

        let remote = self.compute.function_configuration(&function.name)?;

        self.transition(PipelineState::ResolvingRole);
        let resolver = RoleReferenceResolver::new(
            self.compute,
            Some(&template),
            self.config.provider.account_id.as_deref(),
        );

        self.transition(PipelineState::ReconcilingConfig);
        let update = reconcile(function, &self.config.provider, Some(&remote), &resolver)?;
        let config_outcome = submit(self.compute, &update)?;

        self.transition(PipelineState::SyncingArtifact);
        let archive = ArchiveTarget {
            store: self.store,
            bucket,
            directory: &deployment.directory,
        };
        let sync_outcome = sync(
            self.compute,
            &artifact,
            &remote,
            options.force_upload,
            Some(&archive),
        )?;

        info!(
            "Reconciled {} against {} (config: {:?}, code: {:?})",
            function.name, deployment.directory, config_outcome, sync_outcome
        );

        Ok(PipelineReport {
            deployment,
            template_hash: template.content_hash,
            config: config_outcome,
            sync: sync_outcome,
        })
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Desired;
    use crate::reconcile::{FunctionConfigUpdate, RemoteFunctionDescriptor};
    use crate::transport::{
        EncryptionPolicy, ListEntry, ListRequest, ListResponse, StoredObject,
    };
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct FakeStore {
        keys: Vec<String>,
        template_body: &'static str,
        puts: RefCell<Vec<String>>,
    }

    impl ObjectStore for FakeStore {
        fn list(&self, request: &ListRequest) -> Result<ListResponse> {
            Ok(ListResponse {
                entries: self
                    .keys
                    .iter()
                    .filter(|k| k.starts_with(&request.prefix))
                    .map(|k| ListEntry { key: k.clone() })
                    .collect(),
                truncated: false,
                next_continuation_token: None,
            })
        }

        fn get(&self, _: &str, _: &str, _: Option<&EncryptionPolicy>) -> Result<StoredObject> {
            Ok(StoredObject {
                content_type: Some("application/json".to_string()),
                content_length: self.template_body.len() as i64,
                body: Some(self.template_body.as_bytes().to_vec()),
                metadata: HashMap::from([(
                    "filesha256".to_string(),
                    "tpl-hash".to_string(),
                )]),
            })
        }

        fn put(&self, _: &str, key: &str, _: Vec<u8>) -> Result<()> {
            self.puts.borrow_mut().push(key.to_string());
            Ok(())
        }
    }

    struct FakeCompute {
        remote: RemoteFunctionDescriptor,
        config_updates: Cell<u32>,
        code_updates: Cell<u32>,
    }

    impl ComputeService for FakeCompute {
        fn function_configuration(&self, _: &str) -> Result<RemoteFunctionDescriptor> {
            Ok(self.remote.clone())
        }

        fn update_function_configuration(&self, _: &FunctionConfigUpdate) -> Result<()> {
            self.config_updates.set(self.config_updates.get() + 1);
            Ok(())
        }

        fn update_function_code(&self, _: &str, _: Vec<u8>) -> Result<()> {
            self.code_updates.set(self.code_updates.get() + 1);
            Ok(())
        }

        fn identity_role(&self, _: &str) -> Result<String> {
            panic!("no intrinsic roles in these tests")
        }
    }

    fn service_config() -> ServiceConfig {
        let yaml = r#"
service: demo
provider:
  stage: dev
  deploymentBucket: deploy-bucket
  memorySize: 512
functions:
  hello:
    handler: index.run
"#;
        let doc = serde_yaml::from_str(yaml).unwrap();
        ServiceConfig::from_document(&doc, None).unwrap()
    }

    fn artifact(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_full_run_with_no_changes() {
        let config = service_config();
        let file = artifact(b"code");
        let local_hash = ArtifactDescriptor::from_path(file.path())
            .unwrap()
            .content_hash;

        let store = FakeStore {
            keys: vec![
                "serverless/demo/dev/100-2023-01-01T00:00:00.000Z/compiled-cloudformation-template.json"
                    .to_string(),
            ],
            template_body: "{}",
            puts: RefCell::new(Vec::new()),
        };
        let compute = FakeCompute {
            remote: RemoteFunctionDescriptor {
                name: "demo-dev-hello".to_string(),
                code_hash: local_hash,
                memory_size: Some(512),
                ..RemoteFunctionDescriptor::default()
            },
            config_updates: Cell::new(0),
            code_updates: Cell::new(0),
        };

        let mut pipeline = Pipeline::new(&store, &compute, &config);
        let report = pipeline
            .run("hello", file.path(), RunOptions::default())
            .unwrap();

        assert_eq!(report.config, ReconcileOutcome::NoOp);
        assert_eq!(report.sync, SyncOutcome::Skipped);
        assert_eq!(report.template_hash, "tpl-hash");
        assert_eq!(report.deployment.timestamp, 100);
        assert_eq!(*pipeline.state(), PipelineState::Done);
        // The run cached the located record for the later stages
        assert_eq!(pipeline.deployment.as_ref(), Some(&report.deployment));

        // No-op everywhere means zero mutating remote calls
        assert_eq!(compute.config_updates.get(), 0);
        assert_eq!(compute.code_updates.get(), 0);
        assert!(store.puts.borrow().is_empty());
    }

    #[test]
    fn test_full_run_with_changes() {
        let mut config = service_config();
        config
            .functions
            .get_mut("hello")
            .unwrap()
            .memory_size = Desired::Concrete(1024);
        let file = artifact(b"new code");

        let store = FakeStore {
            keys: vec![
                "serverless/demo/dev/100-2023-01-01T00:00:00.000Z/compiled-cloudformation-template.json"
                    .to_string(),
            ],
            template_body: "{}",
            puts: RefCell::new(Vec::new()),
        };
        let compute = FakeCompute {
            remote: RemoteFunctionDescriptor {
                name: "demo-dev-hello".to_string(),
                code_hash: "stale".to_string(),
                memory_size: Some(512),
                ..RemoteFunctionDescriptor::default()
            },
            config_updates: Cell::new(0),
            code_updates: Cell::new(0),
        };

        let mut pipeline = Pipeline::new(&store, &compute, &config);
        let report = pipeline
            .run("hello", file.path(), RunOptions::default())
            .unwrap();

        assert_eq!(report.config, ReconcileOutcome::Updated);
        assert_eq!(report.sync, SyncOutcome::Uploaded);
        assert_eq!(compute.config_updates.get(), 1);
        assert_eq!(compute.code_updates.get(), 1);
        // The uploaded artifact was archived under the deployment directory
        let puts = store.puts.borrow();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].starts_with("serverless/demo/dev/100-2023-01-01T00:00:00.000Z/"));
    }

    #[test]
    fn test_no_prior_deployment_fails_the_run() {
        let config = service_config();
        let file = artifact(b"code");

        let store = FakeStore {
            keys: vec![],
            template_body: "{}",
            puts: RefCell::new(Vec::new()),
        };
        let compute = FakeCompute {
            remote: RemoteFunctionDescriptor::default(),
            config_updates: Cell::new(0),
            code_updates: Cell::new(0),
        };

        let mut pipeline = Pipeline::new(&store, &compute, &config);
        let err = pipeline
            .run("hello", file.path(), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoPriorDeployment { .. }));
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));
    }

    #[test]
    fn test_missing_artifact_fails_before_any_remote_call() {
        let config = service_config();
        let store = FakeStore {
            keys: vec![],
            template_body: "{}",
            puts: RefCell::new(Vec::new()),
        };
        let compute = FakeCompute {
            remote: RemoteFunctionDescriptor::default(),
            config_updates: Cell::new(0),
            code_updates: Cell::new(0),
        };

        let mut pipeline = Pipeline::new(&store, &compute, &config);
        let err = pipeline
            .run("hello", Path::new("/missing.zip"), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }

    #[test]
    fn test_unknown_function() {
        let config = service_config();
        let file = artifact(b"code");
        let store = FakeStore {
            keys: vec![],
            template_body: "{}",
            puts: RefCell::new(Vec::new()),
        };
        let compute = FakeCompute {
            remote: RemoteFunctionDescriptor::default(),
            config_updates: Cell::new(0),
            code_updates: Cell::new(0),
        };

        let mut pipeline = Pipeline::new(&store, &compute, &config);
        let err = pipeline
            .run("ghost", file.path(), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }
}
