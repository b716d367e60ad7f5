//! CDN DNSSEC Key Manager Entry Point
//!
//! This binary runs the DNSSEC key management API with:
//! - Key generation and rotation for CDNs and their delivery services
//! - Key bundle storage in a Redis/DragonflyDB cluster
//! - SQLite metadata (delivery services, match lists, audit log)
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration
//! cdn-dnssec
//!
//! # Run with custom config file
//! cdn-dnssec --config /path/to/config.toml
//!
//! # Local development without a KV cluster
//! cdn-dnssec --memory-kv --example-cdn --bind 127.0.0.1:8055
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cdn_dnssec::dnssec::schema::{insert_cdn, insert_delivery_service, insert_regex};
use cdn_dnssec::dnssec::{
    CdnDnssecBundle, Database, Deadline, DnssecApi, DnssecKeySet, DnssecServiceConfig, KeyKind,
    KeyMaterialFactory, KeyStore, KvCluster, MemoryKvCluster, RedisKvCluster,
};

const EXAMPLE_CDN: &str = "example-cdn";
const EXAMPLE_DOMAIN: &str = "example.local";

/// CDN DNSSEC Key Manager
#[derive(Parser, Debug)]
#[command(name = "cdn-dnssec")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "CDN DNSSEC key lifecycle manager", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API listen address (overrides server.addr)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// SQLite database path (overrides database.path)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Keep key bundles in process memory instead of the KV cluster
    #[arg(long)]
    memory_kv: bool,

    /// Create an example CDN with one delivery service and initial keys
    #[arg(long)]
    example_cdn: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting CDN DNSSEC Key Manager v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = match &args.config {
        Some(path) => DnssecServiceConfig::from_file(path)?,
        None => DnssecServiceConfig::default(),
    };

    // Override with command line arguments
    if let Some(addr) = args.bind {
        config.server.addr = addr;
    }
    if let Some(path) = &args.db_path {
        config.database.path = path.display().to_string();
    }

    config.validate()?;

    // Open metadata database
    let db_path = PathBuf::from(&config.database.path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;
    info!("Metadata database: {}", db_path.display());

    // Connect KV cluster
    let cluster: Arc<dyn KvCluster> = if args.memory_kv {
        warn!("Key bundles are kept in memory and lost on exit");
        Arc::new(MemoryKvCluster::new())
    } else {
        Arc::new(RedisKvCluster::new(&config.kv)?)
    };

    if args.example_cdn {
        create_example_cdn(&config, &db, Arc::clone(&cluster)).await?;
    }

    info!("DNSSEC configuration:");
    info!("  API: {}", config.server.addr);
    if args.memory_kv {
        info!("  KV cluster: in-memory");
    } else {
        info!("  KV cluster: {}:{} (tls: {})", config.kv.host, config.kv.port, config.kv.tls);
    }
    info!("  Algorithm: {} (key size {})", config.crypto.algorithm, config.crypto.key_size);
    info!("  Key generation workers: {}", config.crypto.worker_threads);
    info!("  Request timeout: {}s", config.server.request_timeout_secs);

    let api = Arc::new(DnssecApi::from_config(&config, db, cluster));
    api.run(config.server.addr).await
}

/// Create an example CDN with one HTTP delivery service and initial apex keys
async fn create_example_cdn(
    config: &DnssecServiceConfig,
    db: &Database,
    cluster: Arc<dyn KvCluster>,
) -> anyhow::Result<()> {
    info!("Creating example CDN: {}", EXAMPLE_CDN);

    db.with_conn(|conn| {
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cdn WHERE name = ?1",
            [EXAMPLE_CDN],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Ok(());
        }

        let cdn = insert_cdn(conn, EXAMPLE_CDN, EXAMPLE_DOMAIN)?;
        let ds = insert_delivery_service(conn, "demo", cdn, "HTTP", Some(2), "cdn")?;
        insert_regex(conn, ds, "HOST_REGEXP", r".*\.demo\..*", 0)?;
        Ok(())
    })
    .await?;

    let store = KeyStore::new(cluster);
    let deadline = Deadline::after(config.server.request_timeout());
    if store.get(EXAMPLE_CDN, deadline).await?.is_some() {
        return Ok(());
    }

    let factory = KeyMaterialFactory::new(&config.crypto);
    let now = chrono::Utc::now().timestamp();
    let zone = format!("{}.", EXAMPLE_DOMAIN);
    let ksk = factory
        .mint(factory.request(&zone, KeyKind::Ksk, now, now + 365 * 86_400, 3600), deadline)
        .await?;
    let zsk = factory
        .mint(factory.request(&zone, KeyKind::Zsk, now, now + 30 * 86_400, 3600), deadline)
        .await?;

    let mut bundle = CdnDnssecBundle::new();
    bundle.insert(EXAMPLE_CDN, DnssecKeySet { zsk: vec![zsk], ksk: vec![ksk] });
    store.put(EXAMPLE_CDN, &bundle, deadline).await?;

    info!("Example CDN created; rotate with POST /cdns/dnssecks/generate {{\"key\":\"{}\"...}}", EXAMPLE_CDN);
    Ok(())
}
