use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub fn init_stdout(max_level: Level) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    max_level,
                )),
        )
        .init();
}

/// One JSON object per line, with the current span's fields flattened in.
pub fn init_json(max_level: Level) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stdout)
                .with_thread_names(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    max_level,
                )),
        )
        .init();
}
