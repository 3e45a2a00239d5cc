use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_filter` when set. Worker
/// threads are named, so thread names are included in every line.
pub fn init(default_filter: &str) -> crate::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), default_filter);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_thread_names(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Directives from the environment win unless they are empty or invalid
fn build_filter(env: Option<&str>, default_filter: &str) -> EnvFilter {
    env.filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}
