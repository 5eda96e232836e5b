use clap::ValueEnum;
use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

/// Installs the global tracing subscriber. `level` is an `EnvFilter`
/// directive (`debug`, `info`, ...); `RUST_LOG` overrides it when set.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) => EnvFilter::try_new(env)?,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let registry = tracing_subscriber::Registry::default();
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .json()
                    .with_filter(filter),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init(),
    }
    Ok(())
}
