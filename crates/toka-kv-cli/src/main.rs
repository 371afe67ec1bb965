#![forbid(unsafe_code)]

//! **toka-kv** CLI – interact with a Toka KV base from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toka_kv::{LocalStoreFactory, Manager, ManagerConfig};
use toka_kv_log_memory::MemoryLogClient;
use toka_kv_nats::NatsLogClient;
use toka_kv_store_memory::MemoryStore;
use toka_kv_store_sled::SledStore;
use toka_kv_types::error::KvError;
use toka_kv_types::store::LocalStore;

#[derive(Parser)]
#[command(name = "toka-kv")]
#[command(about = "Toka KV - a distributed, event-sourced key-value store")]
#[command(version)]
struct Cli {
    /// The base (stream) to operate on.
    #[arg(long, default_value = "default")]
    stream: String,

    /// Local store backend to use (memory, sled).
    #[arg(long, default_value = "memory")]
    store: String,

    /// Root directory for the sled store, when `--store sled`.
    #[arg(long, default_value = "toka-kv-data")]
    db_path: PathBuf,

    /// NATS server URL. When omitted, an in-memory log is used, which does
    /// not persist or share state across processes.
    #[arg(long)]
    nats_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a document by id.
    Get {
        /// Document id.
        id: String,
    },
    /// Upsert a document.
    Put {
        /// Document id.
        id: String,
        /// JSON document body.
        data: String,
    },
    /// Insert a document under a fresh, generated id.
    Insert {
        /// JSON document body.
        data: String,
    },
    /// Remove a document.
    Delete {
        /// Document id.
        id: String,
    },
    /// List live document ids, optionally filtered by a regex pattern.
    Keys {
        /// Regex pattern applied as a substring match.
        pattern: Option<String>,
    },
    /// Run a predicate query.
    Query {
        /// JSON query object.
        query: String,
    },
    /// Count documents matching a predicate.
    Count {
        /// JSON query object.
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    info!("starting toka-kv CLI v{}", env!("CARGO_PKG_VERSION"));

    let log: Arc<dyn toka_kv_types::log::LogClient> = match &cli.nats_url {
        Some(url) => Arc::new(NatsLogClient::connect(url).await.context("connecting to NATS")?),
        None => Arc::new(MemoryLogClient::new()),
    };

    let store_factory: Arc<dyn LocalStoreFactory> = match cli.store.as_str() {
        "sled" => Arc::new(SledStoreFactory {
            root: cli.db_path.clone(),
        }),
        "memory" => Arc::new(MemoryStoreFactory),
        other => anyhow::bail!("unknown store backend {other:?}, expected memory or sled"),
    };

    let manager = Manager::new(ManagerConfig::default(), log, store_factory);
    let base = manager
        .get_stream(&cli.stream)
        .await
        .context("opening base")?;

    match cli.command {
        Commands::Get { id } => match base.get(&id).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record.data)?),
            None => println!("null"),
        },
        Commands::Put { id, data } => {
            let data: serde_json::Value = serde_json::from_str(&data).context("parsing data as JSON")?;
            let record = base.put(&id, data).await?;
            println!("{}", serde_json::to_string_pretty(&record.data)?);
        }
        Commands::Insert { data } => {
            let data: serde_json::Value = serde_json::from_str(&data).context("parsing data as JSON")?;
            let (id, record) = base.insert(data).await?;
            println!("{id}");
            println!("{}", serde_json::to_string_pretty(&record.data)?);
        }
        Commands::Delete { id } => {
            let purged = base.delete(&id).await?;
            println!("purged {purged} log entries");
        }
        Commands::Keys { pattern } => {
            let keys = base.keys(pattern.as_deref()).await?;
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Query { query } => {
            let query: serde_json::Value = serde_json::from_str(&query).context("parsing query as JSON")?;
            let results = base
                .query(&query, toka_kv_types::store::QueryOptions::default())
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Count { query } => {
            let query: serde_json::Value = serde_json::from_str(&query).context("parsing query as JSON")?;
            let count = base.count(&query).await?;
            println!("{count}");
        }
    }

    manager.close_all().await;
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

struct MemoryStoreFactory;

#[async_trait]
impl LocalStoreFactory for MemoryStoreFactory {
    async fn open(&self, _stream_name: &str) -> Result<Arc<dyn LocalStore>, KvError> {
        Ok(Arc::new(MemoryStore::new()))
    }
}

struct SledStoreFactory {
    root: PathBuf,
}

#[async_trait]
impl LocalStoreFactory for SledStoreFactory {
    async fn open(&self, stream_name: &str) -> Result<Arc<dyn LocalStore>, KvError> {
        let path = self.root.join(stream_name);
        let store = SledStore::open(&path).map_err(|e| {
            error!(error = %e, path = %path.display(), "failed to open sled store");
            e
        })?;
        Ok(Arc::new(store))
    }
}
