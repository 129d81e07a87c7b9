use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::{orchestrator, pool},
    config::{LogFormat, LoggingSettings},
};

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

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            orchestrator::METRIC_REQUESTS,
            Unit::Count,
            "Render calls received, labelled by format and delivery mode."
        );
        describe_counter!(
            orchestrator::METRIC_LOCAL_HIT,
            Unit::Count,
            "Render calls answered from the local cache."
        );
        describe_counter!(
            orchestrator::METRIC_LOCAL_MISS,
            Unit::Count,
            "Local cache lookups that found nothing usable."
        );
        describe_counter!(
            orchestrator::METRIC_REMOTE_HIT,
            Unit::Count,
            "Durable URL calls answered by a remote existence check."
        );
        describe_histogram!(
            orchestrator::METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Time spent inside the renderer per cache miss."
        );
        describe_histogram!(
            pool::METRIC_POOL_ACQUIRE_MS,
            Unit::Milliseconds,
            "Time callers waited for a rendering session."
        );
        describe_gauge!(
            pool::METRIC_POOL_ACTIVE,
            Unit::Count,
            "Rendering sessions currently leased out."
        );
        describe_counter!(
            pool::METRIC_POOL_INVALIDATIONS,
            Unit::Count,
            "Times the session pool dropped its engine and sessions."
        );
    });
}
