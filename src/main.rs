//! kvbridge - legacy binary-protocol bridge
//!
//! This is the main entry point for the bridge server.
//! It sets up logging, the in-memory backend, the single-node topology and
//! the TCP listener, then runs until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use kvbridge::auth::StaticCredentials;
use kvbridge::cluster::{ServicePorts, StaticTopology};
use kvbridge::{BridgeConfig, CommandTranslator, ExpiryConfig, KvBackend, MemoryBackend, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Management port advertised in the cluster config
const MGMT_PORT: u16 = 8091;

/// Server configuration
#[derive(Debug, Parser)]
#[command(name = "kvbridge", version, about = "Legacy binary-protocol bridge")]
struct Config {
    /// Host to bind to
    #[arg(long, default_value = kvbridge::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = kvbridge::DEFAULT_PORT)]
    port: u16,

    /// Hostname advertised to clients in cluster configs (defaults to --host)
    #[arg(long)]
    advertise_host: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Username accepted by SASL
    #[arg(long, default_value = "Administrator")]
    username: String,

    /// Password for --username
    #[arg(long, default_value = "password")]
    password: String,

    /// Bucket to serve (repeatable)
    #[arg(long = "bucket", default_value = "default")]
    buckets: Vec<String>,

    /// Number of vBuckets in the advertised map
    #[arg(long, default_value_t = 1024)]
    num_vbuckets: usize,

    /// Number of replicas in the advertised map
    #[arg(long, default_value_t = 0)]
    num_replicas: u32,

    /// Deadline for each backend call, in milliseconds
    #[arg(long, default_value_t = 2500)]
    request_timeout_ms: u64,
}

impl Config {
    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.host)
    }
}

fn print_banner(config: &Config) {
    println!(
        r#"
kvbridge v{} - legacy binary-protocol bridge
──────────────────────────────────────────────────────────────
Listening on {}
Buckets: {}

Use Ctrl+C to shutdown gracefully.
"#,
        kvbridge::VERSION,
        config.bind_address(),
        config.buckets.join(", ")
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner(&config);

    let credentials = StaticCredentials::new(&config.username, &config.password);
    info!(user = credentials.username(), "SASL identity configured");
    if config.username == "Administrator" && config.password == "password" {
        warn!("Using the built-in default credentials");
    }

    // Backend with one store per bucket
    let backend = Arc::new(MemoryBackend::new(config.buckets.iter().cloned()));
    let _sweeper = backend.start_sweeper(ExpiryConfig::default());
    info!(buckets = ?config.buckets, "Memory backend initialized");

    let topology = StaticTopology::single_node(
        config.advertised_host(),
        ServicePorts::kv_node(MGMT_PORT, config.port),
        &config.buckets,
        config.num_vbuckets,
        config.num_replicas,
    );

    let translator = CommandTranslator::new(
        Arc::clone(&backend) as Arc<dyn KvBackend>,
        Arc::new(topology),
        Arc::new(credentials),
    );

    let bridge_config = BridgeConfig {
        bind_addr: config.bind_address(),
        request_timeout: Duration::from_millis(config.request_timeout_ms),
        ..BridgeConfig::default()
    };
    let server = Server::bind(&bridge_config, translator).await?;
    info!(addr = %config.bind_address(), "Listening");

    // Set up graceful shutdown
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping server..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, stopping server"),
        }
        shutdown.cancel();
    });

    server.run().await?;

    for (bucket, stats) in backend.stats() {
        info!(
            bucket = %bucket,
            keys = stats.keys,
            gets = stats.get_ops,
            sets = stats.set_ops,
            deletes = stats.del_ops,
            expired = stats.expired,
            "Bucket statistics"
        );
    }
    info!("Server shutdown complete");
    Ok(())
}
