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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "fortunecat_content_viewed_total",
            Unit::Count,
            "Consumer reads that marked fresh content as viewed."
        );
        describe_counter!(
            "fortunecat_text_generated_total",
            Unit::Count,
            "Fortune text generations attempted."
        );
        describe_counter!(
            "fortunecat_image_generated_total",
            Unit::Count,
            "Cat picture generations attempted."
        );
        describe_counter!(
            "fortunecat_generation_failed_total",
            Unit::Count,
            "Generation calls that fell back to default content, labelled by kind."
        );
        describe_counter!(
            "fortunecat_hydration_miss_total",
            Unit::Count,
            "Cold starts that did not restore a persisted screen, labelled by reason."
        );
        describe_counter!(
            "fortunecat_snapshot_persist_failed_total",
            Unit::Count,
            "Screen snapshots that could not be written to the durable store."
        );
        describe_histogram!(
            "fortunecat_text_generation_ms",
            Unit::Milliseconds,
            "Text provider call latency in milliseconds."
        );
        describe_histogram!(
            "fortunecat_image_generation_ms",
            Unit::Milliseconds,
            "Image provider call latency in milliseconds."
        );
        describe_histogram!(
            "fortunecat_index_query_ms",
            Unit::Milliseconds,
            "Similarity index query latency in milliseconds."
        );
        describe_histogram!(
            "fortunecat_example_fetch_ms",
            Unit::Milliseconds,
            "Latency of fetching one example fortune in milliseconds."
        );
        describe_histogram!(
            "fortunecat_store_exists_ms",
            Unit::Milliseconds,
            "Durable store existence check latency in milliseconds."
        );
        describe_histogram!(
            "fortunecat_store_get_ms",
            Unit::Milliseconds,
            "Durable store read latency in milliseconds."
        );
        describe_histogram!(
            "fortunecat_store_put_ms",
            Unit::Milliseconds,
            "Durable store write latency in milliseconds."
        );
    });
}
