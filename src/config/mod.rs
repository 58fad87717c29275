//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{BackendOverrides, CliArgs, Command, ServeArgs, ServeOverrides, WarmArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedwarm";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3002;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CACHE_FEED_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CACHE_NAMESPACE: &str = "warm";
const DEFAULT_CACHE_MEMORY_CAPACITY: u64 = 10_000;
const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_QUEUE_STREAM: &str = "cache_warm_tasks";
const DEFAULT_QUEUE_GROUP: &str = "cache_workers";
const DEFAULT_QUEUE_BATCH_SIZE: u64 = 10;
const DEFAULT_QUEUE_BLOCK_MS: u64 = 5_000;
const DEFAULT_QUEUE_CLAIM_IDLE_MS: u64 = 30_000;
const DEFAULT_QUEUE_ERROR_BACKOFF_MS: u64 = 1_000;
const DEFAULT_QUEUE_MAX_LEN: u64 = 100_000;
const DEFAULT_WORKERS_COUNT: u32 = 8;
const DEFAULT_WORKERS_CONSUMER_PREFIX: &str = "cache-worker";
const DEFAULT_EVENTS_TOPIC: &str = "feed_updates";
const DEFAULT_EVENTS_PARTITIONS: u32 = 8;
const DEFAULT_EVENTS_GROUP: &str = "feed-updaters";
const DEFAULT_EVENTS_BATCH_SIZE: u64 = 32;
const DEFAULT_EVENTS_BLOCK_MS: u64 = 2_000;
const DEFAULT_EVENTS_MAX_LEN: u64 = 100_000;
const DEFAULT_PUSH_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_DISPATCH_LANES: u64 = 4;
const DEFAULT_DISPATCH_LANE_CAPACITY: u64 = 1_024;
const DEFAULT_DISPATCH_ENQUEUE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DISPATCH_PUBLISH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_AUTH_USER_ID_HEADER: &str = "x-user-id";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub workers: WorkerSettings,
    pub events: EventSettings,
    pub push: PushSettings,
    pub dispatch: DispatchSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

/// Where a store or log keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Memory => "memory",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BackendKind::Redis),
            "memory" | "inmemory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend `{other}` (expected redis or memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: BackendKind,
    pub feed_ttl: Duration,
    pub namespace: String,
    pub memory_capacity: NonZeroUsize,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub backend: BackendKind,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub stream: String,
    pub group: String,
    pub batch_size: NonZeroUsize,
    pub block: Duration,
    pub claim_idle: Duration,
    pub error_backoff: Duration,
    /// Approximate stream length kept by `XADD MAXLEN ~`.
    pub max_len: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: NonZeroU32,
    pub consumer_prefix: String,
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub topic: String,
    pub partitions: NonZeroU32,
    pub group: String,
    pub batch_size: NonZeroUsize,
    pub block: Duration,
    /// Approximate length kept per partition stream.
    pub max_len: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub lanes: NonZeroUsize,
    pub lane_capacity: NonZeroUsize,
    pub enqueue_timeout: Duration,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub user_id_header: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FEEDWARM").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Warm(args)) => raw.apply_backend_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    broker: RawBrokerSettings,
    queue: RawQueueSettings,
    workers: RawWorkerSettings,
    events: RawEventSettings,
    push: RawPushSettings,
    dispatch: RawDispatchSettings,
    auth: RawAuthSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_backend_overrides(&overrides.backends);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(backend) = overrides.broker_backend.as_ref() {
            self.broker.backend = Some(backend.clone());
        }
        if let Some(count) = overrides.workers_count {
            self.workers.count = Some(count);
        }
        if let Some(partitions) = overrides.events_partitions {
            self.events.partitions = Some(partitions);
        }
        if let Some(timeout) = overrides.push_timeout_ms {
            self.push.timeout_ms = Some(timeout);
        }
    }

    fn apply_backend_overrides(&mut self, overrides: &BackendOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            redis,
            cache,
            broker,
            queue,
            workers,
            events,
            push,
            dispatch,
            auth,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            broker: build_broker_settings(broker)?,
            queue: build_queue_settings(queue)?,
            workers: build_worker_settings(workers)?,
            events: build_event_settings(events)?,
            push: build_push_settings(push)?,
            dispatch: build_dispatch_settings(dispatch)?,
            auth: build_auth_settings(auth)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_duration(
        Duration::from_secs(graceful_secs),
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_blank(redis.url).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
        return Err(LoadError::invalid(
            "redis.url",
            "expected a redis:// or rediss:// URL",
        ));
    }
    Ok(RedisSettings { url })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = parse_backend(cache.backend, "cache.backend")?;
    let feed_ttl = positive_duration(
        Duration::from_secs(
            cache
                .feed_ttl_seconds
                .unwrap_or(DEFAULT_CACHE_FEED_TTL_SECS),
        ),
        "cache.feed_ttl_seconds",
    )?;
    let namespace = cache
        .namespace
        .unwrap_or_else(|| DEFAULT_CACHE_NAMESPACE.to_string());
    let memory_capacity = non_zero_usize(
        cache
            .memory_capacity
            .unwrap_or(DEFAULT_CACHE_MEMORY_CAPACITY),
        "cache.memory_capacity",
    )?;
    let cleanup_interval = positive_duration(
        Duration::from_secs(
            cache
                .cleanup_interval_seconds
                .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
        ),
        "cache.cleanup_interval_seconds",
    )?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        backend,
        feed_ttl,
        namespace,
        memory_capacity,
        cleanup_interval,
    })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerSettings, LoadError> {
    Ok(BrokerSettings {
        backend: parse_backend(broker.backend, "broker.backend")?,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let stream = required_name(queue.stream, DEFAULT_QUEUE_STREAM, "queue.stream")?;
    let group = required_name(queue.group, DEFAULT_QUEUE_GROUP, "queue.group")?;
    let batch_size = non_zero_usize(
        queue.batch_size.unwrap_or(DEFAULT_QUEUE_BATCH_SIZE),
        "queue.batch_size",
    )?;
    let block = positive_duration(
        Duration::from_millis(queue.block_ms.unwrap_or(DEFAULT_QUEUE_BLOCK_MS)),
        "queue.block_ms",
    )?;
    let claim_idle = positive_duration(
        Duration::from_millis(queue.claim_idle_ms.unwrap_or(DEFAULT_QUEUE_CLAIM_IDLE_MS)),
        "queue.claim_idle_ms",
    )?;
    let error_backoff = positive_duration(
        Duration::from_millis(
            queue
                .error_backoff_ms
                .unwrap_or(DEFAULT_QUEUE_ERROR_BACKOFF_MS),
        ),
        "queue.error_backoff_ms",
    )?;
    let max_len = non_zero_usize(
        queue.max_len.unwrap_or(DEFAULT_QUEUE_MAX_LEN),
        "queue.max_len",
    )?;

    Ok(QueueSettings {
        stream,
        group,
        batch_size,
        block,
        claim_idle,
        error_backoff,
        max_len,
    })
}

fn build_worker_settings(workers: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let count = non_zero_u32(
        workers.count.unwrap_or(DEFAULT_WORKERS_COUNT).into(),
        "workers.count",
    )?;
    let consumer_prefix = required_name(
        workers.consumer_prefix,
        DEFAULT_WORKERS_CONSUMER_PREFIX,
        "workers.consumer_prefix",
    )?;

    Ok(WorkerSettings {
        count,
        consumer_prefix,
    })
}

fn build_event_settings(events: RawEventSettings) -> Result<EventSettings, LoadError> {
    let topic = required_name(events.topic, DEFAULT_EVENTS_TOPIC, "events.topic")?;
    let partitions = non_zero_u32(
        events.partitions.unwrap_or(DEFAULT_EVENTS_PARTITIONS).into(),
        "events.partitions",
    )?;
    let group = required_name(events.group, DEFAULT_EVENTS_GROUP, "events.group")?;
    let batch_size = non_zero_usize(
        events.batch_size.unwrap_or(DEFAULT_EVENTS_BATCH_SIZE),
        "events.batch_size",
    )?;
    let block = positive_duration(
        Duration::from_millis(events.block_ms.unwrap_or(DEFAULT_EVENTS_BLOCK_MS)),
        "events.block_ms",
    )?;
    let max_len = non_zero_usize(
        events.max_len.unwrap_or(DEFAULT_EVENTS_MAX_LEN),
        "events.max_len",
    )?;

    Ok(EventSettings {
        topic,
        partitions,
        group,
        batch_size,
        block,
        max_len,
    })
}

fn build_push_settings(push: RawPushSettings) -> Result<PushSettings, LoadError> {
    Ok(PushSettings {
        timeout: positive_duration(
            Duration::from_millis(push.timeout_ms.unwrap_or(DEFAULT_PUSH_TIMEOUT_MS)),
            "push.timeout_ms",
        )?,
    })
}

fn build_dispatch_settings(dispatch: RawDispatchSettings) -> Result<DispatchSettings, LoadError> {
    let lanes = non_zero_usize(
        dispatch.lanes.unwrap_or(DEFAULT_DISPATCH_LANES),
        "dispatch.lanes",
    )?;
    let lane_capacity = non_zero_usize(
        dispatch
            .lane_capacity
            .unwrap_or(DEFAULT_DISPATCH_LANE_CAPACITY),
        "dispatch.lane_capacity",
    )?;
    let enqueue_timeout = positive_duration(
        Duration::from_millis(
            dispatch
                .enqueue_timeout_ms
                .unwrap_or(DEFAULT_DISPATCH_ENQUEUE_TIMEOUT_MS),
        ),
        "dispatch.enqueue_timeout_ms",
    )?;
    let publish_timeout = positive_duration(
        Duration::from_millis(
            dispatch
                .publish_timeout_ms
                .unwrap_or(DEFAULT_DISPATCH_PUBLISH_TIMEOUT_MS),
        ),
        "dispatch.publish_timeout_ms",
    )?;

    Ok(DispatchSettings {
        lanes,
        lane_capacity,
        enqueue_timeout,
        publish_timeout,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let header = required_name(
        auth.user_id_header,
        DEFAULT_AUTH_USER_ID_HEADER,
        "auth.user_id_header",
    )?
    .to_ascii_lowercase();
    if axum::http::HeaderName::from_bytes(header.as_bytes()).is_err() {
        return Err(LoadError::invalid(
            "auth.user_id_header",
            format!("`{header}` is not a valid header name"),
        ));
    }
    Ok(AuthSettings {
        user_id_header: header,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    backend: Option<String>,
    feed_ttl_seconds: Option<u64>,
    namespace: Option<String>,
    memory_capacity: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    backend: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    stream: Option<String>,
    group: Option<String>,
    batch_size: Option<u64>,
    block_ms: Option<u64>,
    claim_idle_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    max_len: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    count: Option<u32>,
    consumer_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEventSettings {
    topic: Option<String>,
    partitions: Option<u32>,
    group: Option<String>,
    batch_size: Option<u64>,
    block_ms: Option<u64>,
    max_len: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPushSettings {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDispatchSettings {
    lanes: Option<u64>,
    lane_capacity: Option<u64>,
    enqueue_timeout_ms: Option<u64>,
    publish_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    user_id_header: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_backend(value: Option<String>, key: &'static str) -> Result<BackendKind, LoadError> {
    match value {
        Some(value) => BackendKind::from_str(&value).map_err(|reason| LoadError::invalid(key, reason)),
        None => Ok(BackendKind::Redis),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn required_name(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    match value {
        None => Ok(default.to_string()),
        Some(value) => non_blank(Some(value)).ok_or_else(|| LoadError::invalid(key, "must not be empty")),
    }
}

fn positive_duration(value: Duration, key: &'static str) -> Result<Duration, LoadError> {
    if value.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
