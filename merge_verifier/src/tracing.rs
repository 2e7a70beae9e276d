use tracing_subscriber::{filter::LevelFilter, prelude::*, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. Filtering follows `RUST_LOG`; without it
/// `info` and above is printed.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter),
        )
        .init();
}
