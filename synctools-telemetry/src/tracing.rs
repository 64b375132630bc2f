use std::sync::Once;

use ::tracing::subscriber::SetGlobalDefaultError;
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_log::log::SetLoggerError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Directive used by [`init_test_tracing`] when `RUST_LOG` is unset.
const TEST_DEFAULT_DIRECTIVE: &str = "synctools=debug";

/// Errors that can occur while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install the global tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),

    #[error("failed to redirect `log` records into tracing: {0}")]
    LogTracer(#[from] SetLoggerError),
}

/// Installs a global subscriber writing formatted events to stdout.
///
/// Filtering follows `RUST_LOG` when it is set and `default_directive` otherwise
/// (for example `"info"` or `"synctools=debug"`). Records emitted through the `log`
/// crate are forwarded to the same subscriber.
pub fn init_tracing(default_directive: &str) -> Result<(), TracingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true));

    ::tracing::subscriber::set_global_default(subscriber)?;
    LogTracer::init()?;

    Ok(())
}

/// Installs a subscriber routed through the test harness' captured output.
///
/// Safe to call from every test: only the first call installs anything, and a
/// subscriber installed by someone else is left in place.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(TEST_DEFAULT_DIRECTIVE));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer());

        let _ = ::tracing::subscriber::set_global_default(subscriber);
    });
}
