use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::Config;

pub fn init_tracing(config: &Config) {
    let mut layers = Vec::new();

    layers.push(
        tracing_subscriber::fmt::layer()
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .boxed(),
    );

    if let Some(logging_dir) = &config.logging_dir {
        let file_appender = tracing_appender::rolling::daily(logging_dir, "mcdash.log");

        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender)
                .with_filter(LevelFilter::DEBUG)
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
}
