//! Temporal-KV: command-line entry point

use anyhow::Context;
use clap::Parser;
use temporal_kv::cli::{Cli, Commands};
use temporal_kv::store::TemporalStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = cli.store_config()?;
    let store = TemporalStore::open(config.clone())
        .with_context(|| format!("opening store in {}", config.data_dir.display()))?;

    match cli.command {
        Commands::Upsert { key, value } => {
            let timestamp = store.upsert(&key, value).await?;
            println!("{}", timestamp.as_secs());
        }
        Commands::Get { key } => match store.get(&key).await {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        },
        Commands::Travel { key, timestamp } => match store.travel(&key, timestamp).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found at {timestamp})"),
        },
        Commands::Diff { key } => {
            for version in store.diff(&key).await? {
                println!(
                    "{}\t{}",
                    version.timestamp.as_secs(),
                    String::from_utf8_lossy(&version.value)
                );
            }
        }
        Commands::Keys => {
            for key in store.keys().await {
                println!("{key}");
            }
        }
        Commands::Rebuild => {
            let stats = store.rebuild().await?;
            println!(
                "rebuilt from {} records ({} corrupt skipped)",
                stats.records, stats.corrupt_frames
            );
        }
    }

    store.flush().await?;
    Ok(())
}
