use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use axum::http::HeaderName;
use feedwarm::{
    application::{
        background::{BackgroundDispatcher, DispatchConfig, JobRunner},
        coordinator::PostMutationCoordinator,
        error::AppError,
        feed::FeedReader,
        notifier::{Notifier, NotifierConfig},
        preloader::FeedPreloader,
        workers::{WorkerPool, WorkerPoolConfig},
    },
    cache::{CacheConfig, CacheStore, FeedCache, MemoryCacheStore, RedisCacheStore},
    config::{self, BackendKind},
    domain::types::UserId,
    events::{EventBus, MemoryEventBus, RedisEventBus},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, ApiState, HttpState},
        redis_client::{self, RedisHandles},
        telemetry,
    },
    queue::{MemoryWorkQueue, RedisWorkQueue, WorkQueue},
    realtime::ConnectionRegistry,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warm(args) => run_warm(settings, args).await,
    }
}

/// Storage and messaging adapters selected by configuration.
struct Backends {
    cache_store: Arc<dyn CacheStore>,
    /// Set when the cache lives in-process and needs its expiry sweeper.
    memory_cache: Option<Arc<MemoryCacheStore>>,
    queue: Arc<dyn WorkQueue>,
    bus: Arc<dyn EventBus>,
}

async fn connect_redis_if_needed(
    settings: &config::Settings,
    needed: bool,
) -> Result<Option<RedisHandles>, AppError> {
    if !needed {
        return Ok(None);
    }
    Ok(Some(redis_client::connect(&settings.redis.url).await?))
}

fn require_redis<'a>(
    handles: &'a Option<RedisHandles>,
    component: &str,
) -> Result<&'a RedisHandles, AppError> {
    handles.as_ref().ok_or_else(|| {
        AppError::from(InfraError::configuration(format!(
            "{component} uses the redis backend but no connection was opened"
        )))
    })
}

fn build_cache_store(
    settings: &config::Settings,
    redis: &Option<RedisHandles>,
) -> Result<(Arc<dyn CacheStore>, Option<Arc<MemoryCacheStore>>), AppError> {
    match settings.cache.backend {
        BackendKind::Redis => {
            let handles = require_redis(redis, "cache")?;
            let store: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::new(handles.manager.clone()));
            Ok((store, None))
        }
        BackendKind::Memory => {
            let memory = Arc::new(MemoryCacheStore::new(&CacheConfig::from(&settings.cache)));
            let store: Arc<dyn CacheStore> = memory.clone();
            Ok((store, Some(memory)))
        }
    }
}

async fn build_backends(settings: &config::Settings) -> Result<Backends, AppError> {
    let needs_redis = settings.cache.backend == BackendKind::Redis
        || settings.broker.backend == BackendKind::Redis;
    let redis = connect_redis_if_needed(settings, needs_redis).await?;

    let (cache_store, memory_cache) = build_cache_store(settings, &redis)?;

    let (queue, bus) = match settings.broker.backend {
        BackendKind::Redis => {
            let handles = require_redis(&redis, "broker")?;
            let queue: Arc<dyn WorkQueue> = Arc::new(
                RedisWorkQueue::new(
                    handles.client.clone(),
                    handles.manager.clone(),
                    settings.queue.stream.clone(),
                    settings.queue.group.clone(),
                )
                .with_max_len(settings.queue.max_len.get()),
            );
            let bus: Arc<dyn EventBus> = Arc::new(
                RedisEventBus::new(
                    handles.client.clone(),
                    handles.manager.clone(),
                    settings.events.topic.clone(),
                    settings.events.partitions.get(),
                )
                .with_max_len(settings.events.max_len.get()),
            );
            (queue, bus)
        }
        BackendKind::Memory => {
            let queue: Arc<dyn WorkQueue> =
                Arc::new(MemoryWorkQueue::new(settings.queue.group.clone()));
            let bus: Arc<dyn EventBus> =
                Arc::new(MemoryEventBus::new(settings.events.partitions.get()));
            (queue, bus)
        }
    };

    info!(
        cache = settings.cache.backend.as_str(),
        broker = settings.broker.backend.as_str(),
        "Backends ready"
    );

    Ok(Backends {
        cache_store,
        memory_cache,
        queue,
        bus,
    })
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let backends = build_backends(&settings).await?;
    let cancel = CancellationToken::new();

    let cache_config = CacheConfig::from(&settings.cache);
    let cache = FeedCache::new(backends.cache_store.clone(), cache_config.clone());
    let preloader = FeedPreloader::new(repositories.clone(), repositories.clone(), cache.clone());

    let dispatch_config = DispatchConfig::from(&settings.dispatch);
    let dispatcher = BackgroundDispatcher::start(
        JobRunner::new(
            backends.queue.clone(),
            backends.bus.clone(),
            preloader.clone(),
            &dispatch_config,
        ),
        &dispatch_config,
    );

    let registry = Arc::new(ConnectionRegistry::new(settings.push.timeout));
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if let Some(memory) = backends.memory_cache.clone() {
        handles.push(memory.spawn_sweeper(cache_config.cleanup_interval, cancel.clone()));
    }

    let pool = WorkerPool::new(
        backends.queue.clone(),
        preloader,
        WorkerPoolConfig::from_settings(&settings.workers, &settings.queue),
    );
    handles.extend(
        pool.start(cancel.clone())
            .await
            .map_err(|err| AppError::unexpected(format!("worker pool failed to start: {err}")))?,
    );

    let notifier = Notifier::new(
        backends.bus.clone(),
        repositories.clone(),
        registry.clone(),
        NotifierConfig::from_settings(&settings.events, &settings.queue),
    );
    let notifier_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        notifier.run(notifier_cancel).await;
    }));

    let user_id_header = HeaderName::from_bytes(settings.auth.user_id_header.as_bytes())
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;
    let api_state = ApiState {
        feed: FeedReader::new(cache, repositories.clone(), dispatcher.clone()),
        posts: PostMutationCoordinator::new(repositories.clone(), dispatcher.clone()),
        user_id_header: user_id_header.clone(),
    };
    let http_state = HttpState {
        registry,
        user_id_header,
        db: Some(repositories),
    };

    spawn_shutdown_signal(cancel.clone());
    let result = serve_http(&settings, http_state, api_state, cancel.clone()).await;

    cancel.cancel();
    let deadline = Instant::now() + settings.server.graceful_shutdown;
    dispatcher.shutdown(deadline).await;
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
            let _ = handle.await;
        }
    }

    info!("Shutdown complete");
    result
}

async fn run_warm(settings: config::Settings, args: config::WarmArgs) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let redis = connect_redis_if_needed(&settings, settings.cache.backend == BackendKind::Redis)
        .await?;
    let (cache_store, memory_cache) = build_cache_store(&settings, &redis)?;
    if memory_cache.is_some() {
        warn!("Warming an in-process cache; results are discarded when the command exits");
    }

    let cache = FeedCache::new(cache_store, CacheConfig::from(&settings.cache));
    let preloader = FeedPreloader::new(repositories.clone(), repositories, cache);
    let author_id = UserId::new(args.author_id);

    info!(%author_id, "Starting warm pass");
    let feeds = preloader
        .warm(author_id)
        .await
        .map_err(|err| AppError::unexpected(format!("warm pass failed: {err}")))?;
    info!(%author_id, feeds, "Warm pass completed");
    Ok(())
}

/// Cancels `cancel` on Ctrl-C.
fn spawn_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), cancel));
}

/// Cancels `cancel` once `signal` fires. A signal that cannot be installed leaves the process
/// running; it can still be stopped by other means.
async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = signal => match result {
            Ok(()) => {
                info!("Shutdown requested");
                cancel.cancel();
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
        },
        _ = cancel.cancelled() => {}
    }
}

async fn serve_http(
    settings: &config::Settings,
    state: HttpState,
    api: ApiState,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let router = http::build_router(state, Some(api));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();
    let grace = settings.server.graceful_shutdown;

    // Upgraded sockets keep the server alive; bound the drain.
    tokio::select! {
        result = server => result
            .map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        _ = drain_deadline(cancel, grace) => {
            warn!(grace_secs = grace.as_secs(), "Open connections outlived the shutdown grace period");
            Ok(())
        }
    }
}

async fn drain_deadline(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}
