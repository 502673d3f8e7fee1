//! EmberKV - A Disk-Backed Key-Value Store
//!
//! This is the main entry point for the EmberKV server. It parses the
//! command line, opens the store, starts the background maintenance
//! drivers, and accepts connections until shutdown.

use emberkv::commands::CommandHandler;
use emberkv::connection::{handle_connection, ConnectionStats};
use emberkv::storage::{Maintenance, MaintenanceConfig, Store, StoreOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Directory holding the shard files
    data_dir: String,
    /// Optional path for a backup written on shutdown (`.gz` gzips it)
    backup: Option<String>,
    /// Total / collision shard counts
    shards: usize,
    collision_shards: usize,
    /// Expiration sweep interval in seconds, 0 disables
    expire_interval_secs: u64,
    /// Fsync interval in seconds, 0 leaves syncing to the OS
    sync_interval_secs: u64,
    /// TCP keep-alive in seconds, recorded for the listener setup
    keep_alive_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: emberkv::DEFAULT_HOST.to_string(),
            port: emberkv::DEFAULT_PORT,
            data_dir: "./data".to_string(),
            backup: None,
            shards: 256,
            collision_shards: 4,
            expire_interval_secs: 0,
            sync_interval_secs: 0,
            keep_alive_secs: 30,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("EmberKV version {}", emberkv::VERSION);
                    std::process::exit(0);
                }
                _ => {}
            }

            let value = match args.get(i + 1) {
                Some(value) => value.clone(),
                None => {
                    eprintln!("Error: {} requires a value", flag);
                    std::process::exit(1);
                }
            };

            match flag {
                "--host" | "-h" => config.host = value,
                "--port" | "-p" => config.port = parse_or_exit(flag, &value),
                "--data-dir" | "-d" => config.data_dir = value,
                "--backup" | "-b" => config.backup = Some(value),
                "--shards" => config.shards = parse_or_exit(flag, &value),
                "--collision-shards" => config.collision_shards = parse_or_exit(flag, &value),
                "--expire-interval" => {
                    config.expire_interval_secs = parse_or_exit(flag, &value)
                }
                "--sync-interval" => config.sync_interval_secs = parse_or_exit(flag, &value),
                "--keep-alive" => config.keep_alive_secs = parse_or_exit(flag, &value),
                _ => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 2;
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            expire_interval: interval(self.expire_interval_secs),
            sync_interval: interval(self.sync_interval_secs),
        }
    }
}

fn interval(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn parse_or_exit<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", flag, value);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
EmberKV - A Disk-Backed Key-Value Store

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 11211)
    -d, --data-dir <DIR>         Directory for shard files (default: ./data)
    -b, --backup <PATH>          Write a backup here on shutdown; a .gz
                                 suffix selects the gzipped stream
        --shards <N>             Total shard count (default: 256)
        --collision-shards <N>   Collision shard count (default: 4)
        --expire-interval <SECS> Expiration sweep interval, 0 = off
        --sync-interval <SECS>   Fsync interval, 0 = leave it to the OS
        --keep-alive <SECS>      TCP keep-alive period (default: 30)
    -v, --version                Print version information
        --help                   Print this help message

CONNECTING:
    Any memcached text-protocol client works:
    $ printf 'set name 0 0 5\r\nember\r\nget name\r\nquit\r\n' | nc 127.0.0.1 11211
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    // Open the store (shared across all connections)
    let mut opts = StoreOptions::new(&config.data_dir);
    opts.shard_count = config.shards;
    opts.collision_shards = config.collision_shards;
    let store = Arc::new(Store::open(opts)?);
    info!(
        shards = config.shards,
        keys = store.count(),
        "store ready"
    );

    // Start the background maintenance drivers
    let maintenance = Maintenance::start(Arc::clone(&store), config.maintenance());

    // Connection statistics
    let stats = Arc::new(ConnectionStats::new());

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!(
        addr = %config.bind_address(),
        keep_alive_secs = config.keep_alive_secs,
        "listening"
    );

    // Serve until Ctrl+C
    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("shutdown signal received, stopping server");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&store), Arc::clone(&stats)) => {}
        _ = shutdown => {}
    }

    // Stop timers before the final flush so no sweep runs mid-shutdown
    maintenance.stop();

    if let Some(path) = &config.backup {
        write_backup(&store, path);
    }

    store.close()?;
    info!(
        connections = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        "server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, store: Arc<Store>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    error!(client = %addr, error = %e, "failed to set nodelay");
                }

                let handler = CommandHandler::new(Arc::clone(&store));
                let stats = Arc::clone(&stats);

                // the join handle is watched so panics get logged instead
                // of vanishing with the task
                let task = tokio::spawn(handle_connection(stream, addr, handler, stats));
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        if e.is_panic() {
                            error!(client = %addr, "connection task panicked");
                        }
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

/// Writes a shutdown backup, gzipped when the path ends in `.gz`.
fn write_backup(store: &Store, path: &str) {
    let result = std::fs::File::create(path).map_err(Into::into).and_then(|mut file| {
        if path.ends_with(".gz") {
            store.backup_gz(&mut file)
        } else {
            store.backup(&mut file)
        }
    });
    match result {
        Ok(()) => info!(path, "backup written"),
        Err(e) => error!(path, error = %e, "backup failed"),
    }
}
