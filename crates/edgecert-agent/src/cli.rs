//! Command-line interface of `ecert-agent`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::HttpClientFactory;
use crate::config::AgentConfig;
use crate::identity::FileIdentityProvider;
use crate::logging::{init_tracing, LogFormat};
use crate::manager::{CertManager, CertManagerBuilder};
use crate::metrics::CertificateMetrics;
use crate::tls::install_crypto_provider;

/// `ecert-agent` arguments.
#[derive(Debug, Parser)]
#[command(name = "ecert-agent")]
#[command(about = "EdgeCert device certificate agent", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Agent config file (TOML or JSON).
    #[arg(short, long, default_value = "/etc/edgecert/agent.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON regardless of the configured format.
    #[arg(long)]
    pub log_json: bool,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent until interrupted.
    Run {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Sync once, process queued work and exit.
    SyncOnce {
        #[command(flatten)]
        common: CommonArgs,
        /// Give up on queued work after this many seconds.
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
    /// Print the status of every declared certificate.
    Status {
        #[command(flatten)]
        common: CommonArgs,
        /// Print JSON instead of key=value lines.
        #[arg(long)]
        json: bool,
    },
    /// Validate the config and print it with defaults filled in.
    Check {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Run { common }
            | Command::SyncOnce { common, .. }
            | Command::Status { common, .. }
            | Command::Check { common } => common,
        }
    }
}

impl Cli {
    /// Loads the config, installs logging and runs the subcommand.
    pub async fn run(self) -> Result<()> {
        let common = self.command.common().clone();
        let config = AgentConfig::from_file(&common.config)
            .with_context(|| format!("loading {}", common.config.display()))?;

        let format = if common.log_json {
            LogFormat::Json
        } else {
            config.log_format
        };
        init_tracing(format).context("installing log subscriber")?;

        match self.command {
            Command::Run { .. } => run(config).await,
            Command::SyncOnce { timeout_secs, .. } => sync_once(config, Duration::from_secs(timeout_secs)).await,
            Command::Status { json, .. } => status(config, json).await,
            Command::Check { .. } => {
                println!("{}", serde_json::to_string_pretty(&config).context("rendering config")?);
                Ok(())
            }
        }
    }
}

async fn read_ca_bundle(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(pem) => Ok(pem),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "CA bundle not found, using built-in roots for the management service");
            Ok(Vec::new())
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Builds a manager from `config` with the HTTPS management client.
pub async fn build_manager(config: &AgentConfig) -> Result<Arc<CertManager>> {
    install_crypto_provider();
    let identity = FileIdentityProvider::load_or_create(&config.device_key_path)
        .await
        .with_context(|| format!("loading device key {}", config.device_key_path.display()))?;
    info!(device = %crate::identity::IdentityProvider::device_name(&identity), "device identity loaded");

    let ca_pem = read_ca_bundle(&config.ca_bundle_path).await?;
    let factory = HttpClientFactory::new(config.server_url.clone(), ca_pem);
    let metrics = Arc::new(CertificateMetrics::new()?);

    let manager = CertManagerBuilder::from_config(config, Arc::new(identity), Arc::new(factory))
        .metrics(metrics)
        .build()?;
    Ok(Arc::new(manager))
}

fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        token.cancel();
    });
}

async fn run(config: AgentConfig) -> Result<()> {
    let manager = build_manager(&config).await?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);
    info!(server = %config.server_url, "agent started");
    manager.run(token).await?;
    Ok(())
}

async fn sync_once(config: AgentConfig, timeout: Duration) -> Result<()> {
    let manager = build_manager(&config).await?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(&token);

    let report = manager.sync(&token).await?;
    info!(
        synced = report.synced,
        queued = report.queued.len(),
        removed = report.removed.len(),
        failed = report.failed.len(),
        "sync complete"
    );
    for (key, error) in &report.failed {
        warn!(certificate = %key, %error, "sync failure");
    }

    let tasks = manager.start(&token);
    let drained = tokio::time::timeout(timeout, async {
        while !manager.queue().is_empty() && !token.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    if drained.is_err() {
        warn!(remaining = manager.queue().len(), "queued work still pending at timeout");
    }

    for status in manager.status() {
        for (key, value) in status.to_key_values() {
            println!("{}={}", key, value);
        }
    }
    Ok(())
}

async fn status(config: AgentConfig, json: bool) -> Result<()> {
    let manager = build_manager(&config).await?;
    let statuses = manager.inspect().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for status in statuses {
        for (key, value) in status.to_key_values() {
            println!("{}={}", key, value);
        }
    }
    Ok(())
}
