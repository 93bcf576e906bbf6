//! # Redirects CLI (`redirects`)
//!
//! ## Usage
//!
//! ```bash
//! redirects --config ./config/redirects.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `redirects migrate` | Create the SQLite database and schema |
//! | `redirects serve` | Start the HTTP server with the redirect middleware |
//! | `redirects import --old <json> --new <json>` | Consolidate redirects from a content update |
//! | `redirects flatten` | Collapse redirect chains in every dimension |
//! | `redirects list` | List stored redirects |
//! | `redirects resolve <path>` | Dry-run resolution against the stored redirects |
//!
//! Log output goes to stderr and is controlled with `RUST_LOG`
//! (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use redirects::api::{ApiOptions, RedirectsApi};
use redirects::commands::ContentState;
use redirects::config::{self, Config};
use redirects::index::RedirectIndex;
use redirects::resolver::{HostDimensionProvider, RequestResolver};
use redirects::signal::UpdateSignal;
use redirects::sqlite_store::SqliteStore;
use redirects::{db, migrate, server};
use redirects_core::store::SearchFilter;
use redirects_core::Dimension;

/// Redirect service for content-driven sites.
#[derive(Parser)]
#[command(name = "redirects", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/redirects.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and the redirects schema. Safe to rerun.
    Migrate,

    /// Start the HTTP server.
    Serve,

    /// Derive redirects from an old and a new content export and
    /// consolidate them into the store.
    ///
    /// Both files hold a JSON object mapping each dimension to its root
    /// content node.
    Import {
        /// Content export before the update.
        #[arg(long)]
        old: PathBuf,

        /// Content export after the update.
        #[arg(long)]
        new: PathBuf,

        /// User recorded on changed redirects.
        #[arg(long)]
        user: Option<String>,
    },

    /// Point every active redirect directly at the end of its chain.
    Flatten {
        /// User recorded on changed redirects.
        #[arg(long)]
        user: Option<String>,
    },

    /// List stored redirects, sorted by source.
    List {
        /// Restrict to one dimension.
        #[arg(long)]
        dimension: Option<String>,

        /// Only redirects that take part in matching.
        #[arg(long)]
        active_only: bool,
    },

    /// Show what a GET request would be answered with.
    Resolve {
        /// Request path, optionally with a query string.
        path: String,

        /// Host header used to pick the dimension.
        #[arg(long)]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Migrate => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Import { old, new, user } => {
            run_import(&cfg, &old, &new, user.as_deref()).await?;
        }
        Commands::Flatten { user } => {
            run_flatten(&cfg, user.as_deref()).await?;
        }
        Commands::List {
            dimension,
            active_only,
        } => {
            run_list(&cfg, dimension, active_only).await?;
        }
        Commands::Resolve { path, host } => {
            run_resolve(&cfg, &path, host.as_deref()).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let pool = db::connect(&cfg.db).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(Arc::new(SqliteStore::from_config(pool, &cfg.store)))
}

async fn open_api(cfg: &Config) -> anyhow::Result<RedirectsApi> {
    let store = open_store(cfg).await?;
    let api = RedirectsApi::new(
        store,
        Arc::new(UpdateSignal::new()),
        ApiOptions::from_config(cfg),
    )?;
    Ok(api)
}

fn read_state(path: &Path) -> anyhow::Result<ContentState> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read content export: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse content export: {}", path.display()))
}

async fn run_import(
    cfg: &Config,
    old: &Path,
    new: &Path,
    user: Option<&str>,
) -> anyhow::Result<()> {
    let old_state = read_state(old)?;
    let new_state = read_state(new)?;
    let api = open_api(cfg).await?;

    let changes = api
        .create_redirects_from_content(old_state, new_state, user)
        .await?;

    for def in &changes.upserted {
        println!(
            "upsert  [{}] {} -> {} ({}{})",
            def.dimension,
            def.source,
            def.target,
            def.code.as_u16(),
            if def.stale { ", stale" } else { "" }
        );
    }
    for id in &changes.deleted {
        println!("delete  {}", id);
    }
    println!(
        "{} upserted, {} deleted",
        changes.upserted.len(),
        changes.deleted.len()
    );
    Ok(())
}

async fn run_flatten(cfg: &Config, user: Option<&str>) -> anyhow::Result<()> {
    let api = open_api(cfg).await?;
    let changes = api.flatten(user).await?;

    for def in &changes.upserted {
        println!("[{}] {} -> {}", def.dimension, def.source, def.target);
    }
    println!("{} redirects flattened", changes.upserted.len());
    Ok(())
}

async fn run_list(
    cfg: &Config,
    dimension: Option<String>,
    active_only: bool,
) -> anyhow::Result<()> {
    let api = open_api(cfg).await?;
    let filter = SearchFilter {
        dimension: dimension.map(Dimension::new),
        active: active_only.then_some(true),
        ..Default::default()
    };
    let definitions = api.search(&filter).await?;

    if definitions.is_empty() {
        println!("No redirects found.");
        return Ok(());
    }

    for def in &definitions {
        println!(
            "{:<10} {:<4} {:<9} {:<5} {} -> {}",
            def.dimension.as_str(),
            def.code.as_u16(),
            def.redirection_type.as_str(),
            if def.is_active() { "" } else { "stale" },
            def.source,
            def.target
        );
    }
    println!("{} redirects", definitions.len());
    Ok(())
}

async fn run_resolve(cfg: &Config, raw: &str, host: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(cfg).await?;
    let index = Arc::new(RedirectIndex::new(store, cfg.store.timeout()));
    index.load().await?;

    let resolver = RequestResolver::from_config(index, &cfg.resolver)?;
    let dimension = HostDimensionProvider::from_config(&cfg.dimensions).for_host(host);
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };

    match resolver.try_resolve(&axum::http::Method::GET, path, query, &dimension)? {
        Some(redirect) => println!("{} {}", redirect.code.as_u16(), redirect.location),
        None => println!("no redirect for {} in dimension {}", raw, dimension),
    }
    Ok(())
}
