//! 附件存储维护工具
//!
//! ```text
//! attachment-store [--config <file>] [--base-dir <dir>] <command>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use attachment_store::application::AttachmentSystem;
use attachment_store::infrastructure::{init_logging, StoreConfig};
use attachment_store::services::InMemoryParentRecords;
use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "attachment-store", version)]
#[command(about = "Maintenance commands for a content-addressable attachment store")]
struct Cli {
    /// TOML or JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides storage.base_dir from the configuration
    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Delete unreferenced blobs
    Gc,
    /// Print blob store statistics
    Stats,
    /// Re-hash every blob and cross-check the index
    Verify,
    /// Recompute reference counts from the index
    RebuildRefs,
    /// Print the effective configuration
    PrintConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let mut config = StoreConfig::load(cli.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(base_dir) = cli.base_dir {
        config.storage.base_dir = base_dir;
    }
    let _guard = init_logging(&config.logging)?;

    if let Command::PrintConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    info!("Attachment Store v{} - {:?}", env!("CARGO_PKG_VERSION"), cli.command);
    let system = AttachmentSystem::open(config, Arc::new(InMemoryParentRecords::new()))
        .await
        .wrap_err("opening attachment store")?;

    let outcome = run(&system, &cli.command).await;
    system.close().await;
    outcome
}

async fn run(system: &AttachmentSystem, command: &Command) -> eyre::Result<()> {
    match command {
        Command::Gc => {
            let report = system.garbage_collect().await?;
            println!(
                "deleted {} blobs, reclaimed {} bytes ({} failed, {} dangling references)",
                report.deleted_count,
                report.reclaimed_bytes,
                report.failed_deletions,
                report.dangling_references
            );
        }
        Command::Stats => {
            let stats = system.blob_store().stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Verify => {
            let report = system.verify_integrity().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                bail!("integrity check found {} problems", report.error_count());
            }
        }
        Command::RebuildRefs => {
            let referenced = system.pipeline().rebuild_reference_counts().await?;
            println!("{} referenced blobs", referenced);
        }
        Command::PrintConfig => {}
    }
    Ok(())
}
