use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise tracing: env-filter, console output, and an append-only
/// daemon log file under the home directory.
pub fn init(home: &Path, console: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "crew_server=info,crew_core=info,crew_agent=info,tower_http=warn".into());

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(crew_core::paths::log_file_path(home))
        .ok();

    let registry = tracing_subscriber::registry().with(filter);
    match (console, file) {
        (true, Some(file)) => {
            registry
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        (true, None) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        (false, Some(file)) => {
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        (false, None) => {
            registry.init();
        }
    }
}
