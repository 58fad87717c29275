use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the feedwarm binary.
#[derive(Debug, Parser)]
#[command(
    name = "feedwarm",
    version,
    about = "Feed cache warming and live update fan-out"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDWARM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the WebSocket server, warm workers, notifier and dispatcher.
    Serve(Box<ServeArgs>),
    /// Recompute the cached feeds of every friend of one author, then exit.
    Warm(WarmArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BackendOverrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the cache backend (redis|memory).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub backends: BackendOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the feed cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the queue and event bus backend (redis|memory).
    #[arg(long = "broker-backend", value_name = "BACKEND")]
    pub broker_backend: Option<String>,

    /// Override the number of warm workers.
    #[arg(long = "workers-count", value_name = "COUNT")]
    pub workers_count: Option<u32>,

    /// Override the number of event partitions.
    #[arg(long = "events-partitions", value_name = "COUNT")]
    pub events_partitions: Option<u32>,

    /// Override the live push write timeout.
    #[arg(long = "push-timeout-ms", value_name = "MILLIS")]
    pub push_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub overrides: BackendOverrides,

    /// Author whose friends' feeds are recomputed.
    #[arg(value_name = "AUTHOR_ID")]
    pub author_id: i64,
}
