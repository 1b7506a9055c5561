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

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr; stdout is reserved for command output.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(true)
            .boxed(),
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
    METRIC_DESCRIPTIONS.call_once(register_descriptions);
}

fn register_descriptions() {
    describe_counter!(
        "shelfcache_cache_hit_total",
        Unit::Count,
        "Total number of response-cache hits."
    );
    describe_counter!(
        "shelfcache_cache_miss_total",
        Unit::Count,
        "Total number of response-cache misses, including undecodable entries."
    );
    describe_counter!(
        "shelfcache_cache_set_total",
        Unit::Count,
        "Total number of responses written to the backing store."
    );
    describe_counter!(
        "shelfcache_cache_delete_total",
        Unit::Count,
        "Total number of cache keys deleted by key, pattern or tag."
    );
    describe_counter!(
        "shelfcache_cache_error_total",
        Unit::Count,
        "Total number of failed backing-store operations, labelled by operation."
    );
    describe_histogram!(
        "shelfcache_pool_acquire_ms",
        Unit::Milliseconds,
        "Time spent waiting for a pooled backing-store connection."
    );
    describe_counter!(
        "shelfcache_pool_timeout_total",
        Unit::Count,
        "Total number of pool acquisitions that timed out."
    );
    describe_histogram!(
        "shelfcache_warm_cycle_ms",
        Unit::Milliseconds,
        "Cache warm cycle latency in milliseconds."
    );
    describe_gauge!(
        "shelfcache_realtime_connections",
        Unit::Count,
        "Current number of open real-time connections."
    );
    describe_counter!(
        "shelfcache_realtime_broadcast_total",
        Unit::Count,
        "Total number of event frames queued to real-time connections."
    );
    describe_counter!(
        "shelfcache_realtime_reaped_total",
        Unit::Count,
        "Total number of real-time connections terminated by the heartbeat."
    );
    describe_counter!(
        "shelfcache_event_published_total",
        Unit::Count,
        "Total number of domain events published, labelled by type."
    );
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use metrics_util::debugging::DebuggingRecorder;

    use super::*;

    #[test]
    fn every_emitted_metric_is_described() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            register_descriptions();
            // Descriptions are only reported alongside a registered key.
            for name in [
                "shelfcache_cache_hit_total",
                "shelfcache_cache_miss_total",
                "shelfcache_cache_set_total",
                "shelfcache_cache_delete_total",
                "shelfcache_cache_error_total",
                "shelfcache_pool_timeout_total",
                "shelfcache_realtime_broadcast_total",
                "shelfcache_realtime_reaped_total",
                "shelfcache_event_published_total",
            ] {
                metrics::counter!(name).increment(0);
            }
            metrics::gauge!("shelfcache_realtime_connections").set(0.0);
            metrics::histogram!("shelfcache_pool_acquire_ms").record(0.0);
            metrics::histogram!("shelfcache_warm_cycle_ms").record(0.0);
        });

        let described: BTreeSet<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(_, _, description, _)| description.is_some())
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        assert_eq!(described.len(), 12, "described: {described:?}");
    }
}
