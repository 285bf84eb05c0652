//! # Command Line Interface
//!
//! `serve` loads manifests and serves the resulting configuration over ADS;
//! `check` builds the same configuration once and reports object statuses.

pub mod output;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::Config;
use crate::k8s::manifest::load_path;
use crate::observability::{init_observability, log_config_info};
use crate::xds::{serve, ResourceType};
use crate::{EventHandler, APP_NAME, VERSION};
use output::{render, CheckReport, OutputFormat};

#[derive(Parser, Debug)]
#[command(name = "gangway")]
#[command(about = "Kubernetes ingress to Envoy xDS control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the configuration built from manifests over ADS
    Serve {
        /// Manifest files or directories of YAML manifests
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Build the configuration once and report object statuses
    Check {
        /// Manifest files or directories of YAML manifests
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,

        /// Exit with an error when any object is invalid or orphaned
        #[arg(long)]
        strict: bool,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }

    match cli.command {
        Commands::Serve { manifests } => {
            init_observability(&config.observability)?;
            info!(app_name = APP_NAME, version = VERSION, "Starting gangway control plane");
            log_config_info(&config);

            let handler = load_handler(&config, &manifests)?;
            handler.rebuild();
            serve(&config.xds.bind_address(), handler.cache(), async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
            })
            .await?;
            info!("Control plane shutdown completed");
        }

        Commands::Check { manifests, output, strict } => {
            let handler = load_handler(&config, &manifests)?;
            handler.rebuild();
            let report = check_report(&handler);
            println!("{}", render(&report, output)?);
            if strict && report.invalid_count() > 0 {
                anyhow::bail!("{} object(s) are not valid", report.invalid_count());
            }
        }
    }

    Ok(())
}

fn load_handler(config: &Config, manifests: &[PathBuf]) -> anyhow::Result<EventHandler> {
    let handler = EventHandler::new(config);
    for path in manifests {
        load_into(&handler, path)?;
    }
    Ok(handler)
}

fn load_into(handler: &EventHandler, path: &Path) -> anyhow::Result<()> {
    let objects = load_path(path)
        .with_context(|| format!("Failed to load manifests from {}", path.display()))?;
    info!(path = %path.display(), objects = objects.len(), "Loaded manifests");
    for object in objects {
        handler.on_add(object);
    }
    Ok(())
}

pub fn check_report(handler: &EventHandler) -> CheckReport {
    let cache = handler.cache();
    let resources = ResourceType::ALL
        .into_iter()
        .map(|t| (t.type_url().to_string(), cache.resource_names(t)))
        .collect::<BTreeMap<_, _>>();
    CheckReport { statuses: handler.statuses(), resources }
}
