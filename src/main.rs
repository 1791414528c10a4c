//! # Context Relay CLI (`ctxr`)
//!
//! The `ctxr` binary drives the context pipeline for operators and cron
//! jobs. It provides commands for syncing from the origin store,
//! inspecting cache status, assembling context bundles, and managing
//! the vector index.
//!
//! ## Usage
//!
//! ```bash
//! ctxr --config ./config/ctxr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxr status` | Show sync state, file count, and last sync time |
//! | `ctxr sync` | Force a fresh origin fetch and cache refresh |
//! | `ctxr context` | Print the assembled context bundle for a scope |
//! | `ctxr ask "<question>"` | Print the retrieval-backed context block |
//! | `ctxr rebuild-index` | Re-chunk, re-embed, and re-upsert everything |
//! | `ctxr clear-cache` | Reset both cache tiers |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use context_relay::assets::{BinaryAssetUploadManager, HttpAssetHost};
use context_relay::cache::{HttpKvStore, KeyValueStore};
use context_relay::config::{load_config, Config};
use context_relay::coordinator::TieredCacheCoordinator;
use context_relay::embedding::HttpEmbedder;
use context_relay::index::{HttpVectorIndex, VectorIndexer};
use context_relay::models::FolderScope;
use context_relay::origin::{HttpOrigin, OriginFetchAdapter};
use context_relay::roles::{ConfigRoleMappings, RoleFilter};

/// Context Relay CLI — tiered context assembly, caching, and retrieval
/// for AI assistants.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `config/ctxr.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ctxr",
    about = "Context Relay — tiered context assembly, caching, and retrieval for AI assistants",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ctxr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the sync state of the context cache.
    Status,

    /// Force a fresh origin fetch.
    ///
    /// Walks the origin tree, uploads binaries, syncs the vector index,
    /// and refreshes both cache tiers. Coalesces with any fetch already
    /// in flight in this process.
    Sync,

    /// Print the assembled context bundle.
    Context {
        /// Comma-separated caller roles; omitted = full access.
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// Print the retrieval-backed context block for a question.
    Ask {
        /// The question to retrieve context for.
        question: String,

        /// Comma-separated caller roles; omitted = full access.
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// Re-chunk, re-embed, and re-upsert all indexed documents.
    RebuildIndex,

    /// Reset the process cache and delete the distributed cache entry.
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let coordinator = build_coordinator(&config)?;

    match cli.command {
        Commands::Status => {
            let status = coordinator.get_status().await;
            println!("state: {}", status.state);
            println!("files: {}", status.file_count);
            for name in &status.file_names {
                println!("  {}", name);
            }
            match status.last_synced {
                Some(ts) => println!("last synced: {}", ts.to_rfc3339()),
                None => println!("last synced: never"),
            }
        }
        Commands::Sync => {
            let status = coordinator.trigger_sync().await?;
            println!("sync ok");
            println!("  files: {}", status.file_count);
            if let Some(ts) = status.last_synced {
                println!("  synced at: {}", ts.to_rfc3339());
            }
        }
        Commands::Context { roles } => {
            let scope = resolve_scope(&config, &roles).await;
            let bundle = coordinator.get_context(&scope).await;
            print_bundle_summary(&bundle);
            println!();
            println!("{}", bundle.text_block);
        }
        Commands::Ask { question, roles } => {
            let scope = resolve_scope(&config, &roles).await;
            let bundle = coordinator.retrieve(&question, &scope).await;
            print_bundle_summary(&bundle);
            println!();
            println!("{}", bundle.text_block);
        }
        Commands::RebuildIndex => {
            let stats = coordinator.trigger_index_rebuild().await?;
            println!("rebuild ok");
            println!("  files: {}", stats.file_count);
            println!("  chunks: {}", stats.chunk_count);
        }
        Commands::ClearCache => {
            coordinator.clear_cache().await;
            println!("cache cleared");
        }
    }

    Ok(())
}

/// Wire the pipeline from config. Optional tiers (L2 cache, asset host,
/// vector index) are only constructed when configured; the coordinator
/// degrades around the missing ones.
fn build_coordinator(config: &Config) -> Result<TieredCacheCoordinator> {
    let origin = HttpOrigin::new(&config.origin)?;
    let adapter = OriginFetchAdapter::new(Arc::new(origin), config.origin.root_id.clone());

    let assets = match &config.assets.api_base {
        Some(_) => Some(BinaryAssetUploadManager::new(
            Arc::new(HttpAssetHost::new(&config.assets)?),
            &config.assets,
        )),
        None => None,
    };

    let indexer = match (&config.embedding.api_base, &config.index.api_base) {
        (Some(_), Some(_)) => Some(VectorIndexer::new(
            Arc::new(HttpEmbedder::new(&config.embedding)?),
            Arc::new(HttpVectorIndex::new(&config.index)?),
            config.chunking.clone(),
            &config.embedding,
            &config.index,
        )),
        _ => None,
    };

    let kv: Option<Arc<dyn KeyValueStore>> = match &config.kv.url {
        Some(_) => Some(Arc::new(HttpKvStore::new(&config.kv)?)),
        None => None,
    };

    let cache_key = format!("{}:context:{}", config.cache.key_prefix, config.origin.root_id);
    Ok(TieredCacheCoordinator::new(
        adapter,
        assets,
        indexer,
        kv,
        cache_key,
        config.cache.clone(),
        config.retrieval.clone(),
    ))
}

async fn resolve_scope(config: &Config, roles: &[String]) -> FolderScope {
    if roles.is_empty() {
        return FolderScope::Wildcard;
    }
    let filter = RoleFilter::new(Arc::new(ConfigRoleMappings::new(&config.roles)));
    filter.folders_for_roles(roles).await
}

fn print_bundle_summary(bundle: &context_relay::models::ContextBundle) {
    println!("files: {}", bundle.source_file_names.join(", "));
    if !bundle.binary_asset_refs.is_empty() {
        println!("assets:");
        for asset in &bundle.binary_asset_refs {
            println!("  {} ({}) -> {}", asset.file_name, asset.mime_type, asset.provider_uri);
        }
    }
}
