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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachet_fragment_hit_total",
            Unit::Count,
            "Fragment store lookups that returned a payload."
        );
        describe_counter!(
            "cachet_fragment_miss_total",
            Unit::Count,
            "Fragment store lookups that found nothing."
        );
        describe_counter!(
            "cachet_fragment_unavailable_total",
            Unit::Count,
            "Fragment store operations that failed open because the backend errored or timed out."
        );
        describe_counter!(
            "cachet_fragment_evict_total",
            Unit::Count,
            "Fragments evicted from the in-process backend due to capacity."
        );
        describe_counter!(
            "cachet_touch_total",
            Unit::Count,
            "Resources whose generation was bumped, including propagated touches."
        );
        describe_histogram!(
            "cachet_propagation_ms",
            Unit::Milliseconds,
            "Latency of one touch propagation including sink notification."
        );
        describe_counter!(
            "cachet_conditional_not_modified_total",
            Unit::Count,
            "Conditional requests answered with 304 Not Modified."
        );
        describe_counter!(
            "cachet_page_materialize_total",
            Unit::Count,
            "Page artifacts written to disk."
        );
        describe_counter!(
            "cachet_page_materialize_failed_total",
            Unit::Count,
            "Page artifact writes that failed."
        );
        describe_counter!(
            "cachet_page_invalidate_total",
            Unit::Count,
            "Page artifacts removed by invalidation."
        );
        describe_histogram!(
            "cachet_warm_ms",
            Unit::Milliseconds,
            "Duration of one warm run."
        );
    });
}
