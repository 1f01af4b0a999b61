//! Huddle: realtime party sync core
//!
//! Main binary with subcommands:
//! - `simulate`: Drive the sync core end to end against in-process collaborators
//! - `fetch-party`: Fetch a party and its comments from the remote store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use huddle_sync::{Comment, Party, Repository, RestStore, SyncConfig};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod simulate;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Realtime sync and caching core for the Huddle party client", long_about = None)]
struct Cli {
    /// JSON file with sync settings (cache lifetimes, intervals)
    #[arg(long, global = true, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a party through fetch, subscribe, live comments and unsubscribe in-process
    Simulate {
        /// Number of live comments to publish while subscribed
        #[arg(long, default_value = "3")]
        comments: usize,

        /// Print every cache update as it happens
        #[arg(long)]
        print_updates: bool,
    },

    /// Fetch a party and its comments and print them as JSON
    FetchParty {
        /// Remote store URL
        #[arg(long, env = "HUDDLE_STORE_URL")]
        store_url: String,

        /// Project API key
        #[arg(long, env = "HUDDLE_API_KEY")]
        api_key: String,

        /// Party id
        #[arg(value_name = "PARTY_ID")]
        party_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "huddle=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            comments,
            print_updates,
        } => {
            let config = load_config(cli.config.as_deref())?;
            simulate::run(config, comments, print_updates).await
        }

        Commands::FetchParty {
            store_url,
            api_key,
            party_id,
        } => fetch_party(&store_url, &api_key, party_id).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("failed to read config {}: {}", path.display(), e))?;
    SyncConfig::from_json(&json)
        .map_err(|e| miette::miette!("invalid config {}: {}", path.display(), e))
}

async fn fetch_party(store_url: &str, api_key: &str, party_id: Uuid) -> Result<()> {
    let store = RestStore::new(store_url, api_key).map_err(|e| miette::miette!("{}", e))?;
    let repo = Repository::new(Arc::new(store));
    let output = party_snapshot(&repo, party_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).into_diagnostic()?
    );
    Ok(())
}

/// One-shot read of a party and its comments, newest first. Nothing is cached.
async fn party_snapshot(repo: &Repository, party_id: Uuid) -> Result<serde_json::Value> {
    let party: Party = repo
        .fetch_one(party_id)
        .await
        .map_err(|e| miette::miette!("failed to fetch party {}: {}", party_id, e))?;
    let comments: Vec<Comment> = repo
        .fetch_children(party_id)
        .await
        .map_err(|e| miette::miette!("failed to fetch comments for {}: {}", party_id, e))?;

    Ok(serde_json::json!({
        "party": party,
        "comments": comments,
    }))
}
