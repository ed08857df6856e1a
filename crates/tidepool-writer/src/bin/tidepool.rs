//! tidepool — administer the stores under one root directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tidepool_writer::{Config, Registry, WriterError, DEFAULT_EXTENSION};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(about = "Inspect and modify Tidepool stores")]
struct Args {
    /// Directory holding the store files
    #[arg(long, env = "TIDEPOOL_ROOT")]
    root: PathBuf,

    /// Store file extension
    #[arg(long, env = "TIDEPOOL_EXT", default_value = DEFAULT_EXTENSION)]
    ext: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every store under the root
    List,
    /// Create an empty store
    Create { name: String },
    /// Delete a store file
    Drop { name: String },
    /// Set KEY to VALUE
    Put { name: String, key: String, value: String },
    /// Remove KEY
    Delete { name: String, key: String },
    /// Print the value of KEY
    Get { name: String, key: String },
    /// Print entries with FROM <= key < TO
    Scan {
        name: String,
        #[arg(long, default_value = "")]
        from: String,
        /// Exclusive upper bound; empty scans to the end
        #[arg(long, default_value = "")]
        to: String,
        #[arg(long)]
        keys_only: bool,
    },
    /// Rewrite a store without dead records
    Compact { name: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::interactive(&args.root).with_extension(args.ext);
    let registry = Registry::new(config).context("invalid configuration")?;

    let outcome = run(&registry, args.command).await;
    registry.shutdown().await;
    outcome
}

async fn run(registry: &Registry, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => {
            for name in registry.list_stores() {
                println!("{}", name);
            }
        }
        Command::Create { name } => {
            registry.create_store(&name).with_context(|| format!("creating {}", name))?;
        }
        Command::Drop { name } => {
            registry.drop_store(&name).await.with_context(|| format!("dropping {}", name))?;
        }
        Command::Put { name, key, value } => {
            registry.store(&name, key, value.into_bytes()).await?;
        }
        Command::Delete { name, key } => {
            registry.delete(&name, key).await?;
        }
        Command::Get { name, key } => {
            let value = registry.get(&name, &key)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Scan { name, from, to, keys_only } => {
            if keys_only {
                registry.scan_keys(&name, &from, &to, |key| {
                    println!("{}", key);
                    Ok::<_, WriterError>(())
                })?;
            } else {
                registry.scan_range(&name, &from, &to, |key, value| {
                    println!("{}\t{}", key, String::from_utf8_lossy(value));
                    Ok::<_, WriterError>(())
                })?;
            }
        }
        Command::Compact { name } => {
            let stats = registry.compact(&name).await?;
            info!(
                store = %name,
                live_entries = stats.live_entries,
                bytes_saved = stats.bytes_saved(),
                "Compacted"
            );
        }
    }
    Ok(())
}
