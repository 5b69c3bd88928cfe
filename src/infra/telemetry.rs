use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

/// Register units and help text for every metric the crate emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "vitrine_query_hit_total",
            Unit::Count,
            "Reads answered from cached data, labelled fresh or stale."
        );
        describe_counter!(
            "vitrine_query_miss_total",
            Unit::Count,
            "Reads that had to wait for the network."
        );
        describe_counter!(
            "vitrine_query_dedup_total",
            Unit::Count,
            "Fetches that joined an in-flight load for the same key."
        );
        describe_counter!(
            "vitrine_query_evict_total",
            Unit::Count,
            "Cache entries removed by garbage collection or capacity."
        );
        describe_counter!(
            "vitrine_mutation_total",
            Unit::Count,
            "Settled mutations labelled by outcome."
        );
        describe_counter!(
            "vitrine_rotation_draw_total",
            Unit::Count,
            "Sponsored items drawn by the rotation engine."
        );
        describe_histogram!(
            "vitrine_query_fetch_ms",
            Unit::Milliseconds,
            "Loader latency in milliseconds, retries included."
        );
        describe_histogram!(
            "vitrine_mutation_ms",
            Unit::Milliseconds,
            "Time from optimistic write to settlement in milliseconds."
        );
    });
}
