use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub(crate) const METRIC_CACHE_HIT: &str = "feedwarm_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "feedwarm_cache_miss_total";
pub(crate) const METRIC_WARM_MS: &str = "feedwarm_warm_ms";
pub(crate) const METRIC_QUEUE_ENTRIES: &str = "feedwarm_queue_entries_total";
pub(crate) const METRIC_PUSH: &str = "feedwarm_push_total";
pub(crate) const METRIC_EVENTS: &str = "feedwarm_events_total";
pub(crate) const METRIC_BACKGROUND_DROPPED: &str = "feedwarm_background_dropped_total";
pub(crate) const METRIC_CONNECTIONS: &str = "feedwarm_connections";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Feed reads served from the cache."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Feed reads that fell back to the source of truth."
        );
        describe_histogram!(
            METRIC_WARM_MS,
            Unit::Milliseconds,
            "Latency of one author warm pass in milliseconds."
        );
        describe_counter!(
            METRIC_QUEUE_ENTRIES,
            Unit::Count,
            "Warm queue entries handled, labelled by outcome."
        );
        describe_counter!(
            METRIC_PUSH,
            Unit::Count,
            "Live push attempts, labelled by outcome."
        );
        describe_counter!(
            METRIC_EVENTS,
            Unit::Count,
            "Lifecycle events handled by the notifier, labelled by outcome."
        );
        describe_counter!(
            METRIC_BACKGROUND_DROPPED,
            Unit::Count,
            "Background jobs dropped because their lane was full or closed."
        );
        describe_gauge!(
            METRIC_CONNECTIONS,
            Unit::Count,
            "Currently registered live connections."
        );
    });
}
