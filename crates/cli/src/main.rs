use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::{Term, style};
use slipway_core::reconcile::{self, FunctionConfigUpdate, RemoteFunctionDescriptor};
use slipway_core::transport::ComputeService;
use slipway_core::{ArtifactDescriptor, RoleReferenceResolver, ServiceConfig};
use tracing_subscriber::EnvFilter;

/// slipway - serverless deployment reconciler
#[derive(Parser)]
#[command(name = "slipway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a configuration file and print the fully-resolved document
    Resolve {
        /// Path to the configuration file
        #[arg(default_value = "serverless.yml")]
        config: PathBuf,
    },

    /// Print the content hash and size of a local artifact
    Fingerprint {
        /// Path to the built artifact
        artifact: PathBuf,
    },

    /// Compute the configuration patch for a function without calling
    /// the platform
    Plan {
        /// Path to the configuration file
        #[arg(default_value = "serverless.yml")]
        config: PathBuf,

        /// Function key to plan for
        #[arg(short, long)]
        function: String,

        /// Stage override
        #[arg(short, long)]
        stage: Option<String>,

        /// JSON file holding the function's current remote descriptor
        #[arg(short, long)]
        remote: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Resolve { config } => cmd_resolve(&config),
        Commands::Fingerprint { artifact } => cmd_fingerprint(&artifact),
        Commands::Plan {
            config,
            function,
            stage,
            remote,
        } => cmd_plan(&config, &function, stage.as_deref(), remote.as_deref()),
    };

    if let Err(e) = result {
        let term = Term::stderr();
        let _ = term.write_line(&format!("{} {:#}", style("error:").red().bold(), e));
        std::process::exit(1);
    }
}

fn cmd_resolve(config: &Path) -> Result<()> {
    let doc = slipway_core::load(config)?;
    print!("{}", serde_yaml::to_string(&doc)?);
    Ok(())
}

fn cmd_fingerprint(artifact: &Path) -> Result<()> {
    let descriptor = ArtifactDescriptor::from_path(artifact)?;
    println!("{} {} bytes", descriptor.content_hash, descriptor.size_bytes);
    Ok(())
}

fn cmd_plan(
    config: &Path,
    function_key: &str,
    stage: Option<&str>,
    remote: Option<&Path>,
) -> Result<()> {
    let term = Term::stderr();

    let doc = slipway_core::load(config)?;
    let service = ServiceConfig::from_document(&doc, stage)?;

    let Some(function) = service.functions.get(function_key) else {
        bail!(
            "function '{}' is not defined in {}",
            function_key,
            config.display()
        );
    };

    let remote = remote
        .map(|path| -> Result<RemoteFunctionDescriptor> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read remote descriptor {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid remote descriptor {}", path.display()))
        })
        .transpose()?;

    let compute = OfflineCompute;
    let resolver =
        RoleReferenceResolver::new(&compute, None, service.provider.account_id.as_deref());
    let update = reconcile::reconcile(function, &service.provider, remote.as_ref(), &resolver)?;

    if update.is_noop() {
        term.write_line(&format!(
            "{} {} matches the desired configuration; nothing to update",
            style("✓").green().bold(),
            function.name
        ))?;
    } else {
        term.write_line(&format!(
            "{} Patch for {}:",
            style("::").cyan().bold(),
            function.name
        ))?;
        println!("{}", serde_json::to_string_pretty(&update)?);
    }
    Ok(())
}

/// Compute capability for offline planning; every remote operation is
/// unavailable and reports a transport error
struct OfflineCompute;

impl ComputeService for OfflineCompute {
    fn function_configuration(
        &self,
        _: &str,
    ) -> slipway_core::Result<RemoteFunctionDescriptor> {
        Err(offline("getFunctionConfiguration"))
    }

    fn update_function_configuration(
        &self,
        _: &FunctionConfigUpdate,
    ) -> slipway_core::Result<()> {
        Err(offline("updateFunctionConfiguration"))
    }

    fn update_function_code(&self, _: &str, _: Vec<u8>) -> slipway_core::Result<()> {
        Err(offline("updateFunctionCode"))
    }

    fn identity_role(&self, _: &str) -> slipway_core::Result<String> {
        Err(offline("getIdentityRole"))
    }
}

fn offline(operation: &str) -> slipway_core::Error {
    slipway_core::Error::transport(operation, "not available in offline planning")
}
