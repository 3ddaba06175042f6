//! CLI for the Strix shell
//!
//! Provides commands:
//! - `run`: Start the shell with the extension runtime (default)
//! - `list`: Enumerate installed extensions
//! - `validate`: Check a single extension package without installing it

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use strix_extensions::{
    load_extension, ExtensionRuntime, RuntimeConfig, RuntimeEvent,
};

use crate::config::ShellConfig;

/// Strix browser shell CLI
#[derive(Parser, Debug)]
#[command(name = "strix")]
#[command(about = "Desktop browser shell with a WebExtensions-style runtime")]
#[command(version)]
pub struct Cli {
    /// Directory holding extension packages
    #[arg(long, global = true, env = "STRIX_EXTENSIONS_DIR")]
    pub extensions_dir: Option<PathBuf>,

    /// Profile data directory
    #[arg(long, global = true, env = "STRIX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file path (defaults to strix.toml in the data directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the shell (default)
    Run,
    /// List installed extensions
    List,
    /// Validate an extension package directory
    Validate {
        /// Package directory to check
        path: PathBuf,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let config = ShellConfig::resolve(
        cli.extensions_dir,
        cli.data_dir,
        cli.config.as_deref(),
    )?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => serve(config).await,
        Commands::List => list(config).await,
        Commands::Validate { path } => validate(&config, &path),
    }
}

async fn serve(config: ShellConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let runtime_config = RuntimeConfig::default()
        .with_extensions_dir(&config.extensions_dir)
        .with_storage_path(config.storage_path())
        .with_locale(&config.locale);
    let runtime = ExtensionRuntime::new(runtime_config).await?;

    let report = runtime.load_extensions().await?;
    info!(
        "{} extensions loaded from {}",
        report.loaded.len(),
        config.extensions_dir.display()
    );
    for invalid in &report.invalid {
        warn!("invalid package {}: {}", invalid.path.display(), invalid.error);
    }

    // Surface runtime activity in the shell log until real UI surfaces exist.
    let mut events = runtime.subscribe();
    let observer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                RuntimeEvent::RequestBlocked { extension_id, url } => {
                    info!("{} blocked {}", extension_id, url);
                }
                RuntimeEvent::RequestRedirected {
                    extension_id,
                    url,
                    target,
                } => {
                    info!("{} redirected {} -> {}", extension_id, url, target);
                }
                other => info!("runtime event: {:?}", other),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown().await;
    observer.abort();
    Ok(())
}

async fn list(config: ShellConfig) -> Result<()> {
    let runtime_config = RuntimeConfig::default()
        .with_extensions_dir(&config.extensions_dir)
        .with_locale(&config.locale);
    let runtime = ExtensionRuntime::new(runtime_config).await?;
    let report = runtime.load_extensions().await?;

    if report.loaded.is_empty() && report.invalid.is_empty() {
        println!("No extensions in {}", config.extensions_dir.display());
    }
    for extension in runtime.list_extensions().await {
        println!(
            "{:<24} {:<12} {}",
            extension.id, extension.manifest.version, extension.manifest.name
        );
    }
    for invalid in &report.invalid {
        println!("{:<24} INVALID      {}", invalid.path.display(), invalid.error);
    }

    runtime.shutdown().await;
    Ok(())
}

fn validate(config: &ShellConfig, path: &PathBuf) -> Result<()> {
    match load_extension(path, &config.locale) {
        Ok(extension) => {
            println!(
                "OK: {} v{} ({})",
                extension.manifest.name, extension.manifest.version, extension.id
            );
            if extension.manifest.has_background_page() {
                println!("  background page declared");
            }
            for permission in &extension.manifest.permissions {
                println!("  permission: {permission}");
            }
            Ok(())
        }
        Err(e) => {
            error!("package {} failed validation: {}", path.display(), e);
            anyhow::bail!("invalid package: {e}")
        }
    }
}
