use time::UtcOffset;
use time::macros::format_description;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{DynError, config::Environment};

/// Installs the global subscriber. `RUST_LOG` wins over the defaults.
///
/// Must run before the tokio runtime spawns its workers: the local UTC offset
/// can only be read while the process is single threaded.
pub fn init(env_cargo_crate_name: &str, environment: Environment) -> Result<(), DynError> {
    let offset = UtcOffset::current_local_offset()?;
    let timer = OffsetTime::new(offset, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"));
    let default_level = match environment {
        Environment::Development => "debug",
        Environment::Production => "info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{env_cargo_crate_name}={default_level},tower_http=error").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_ansi(environment == Environment::Development)
                .with_timer(timer),
        )
        .try_init()?;
    Ok(())
}
