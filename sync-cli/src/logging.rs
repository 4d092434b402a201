use anyhow::Result;
use std::env;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let is_production = env::var("DRIVER_SYNC_ENV")
        .map(|value| value == "production")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("driver_sync={level},driverctl={level},events_bus={level},sqlx=warn,reqwest=info")
            .into()
    });

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
