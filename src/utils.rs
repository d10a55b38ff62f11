#[cfg(feature = "logging")]
use crate::error::LoggingError;

/// Installs a global `tracing` subscriber: `RUST_LOG` filtering (`info` when
/// unset), formatted output, and progress bars for dispatch spans.
///
/// Fails if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), LoggingError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::new("info"),
    };

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
