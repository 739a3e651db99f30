use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt as _,
};

/// Installs the global subscriber: human readable output on stdout and, when
/// `LOG_DIR` is set, a daily JSON log file next to it.
///
/// The returned guard flushes the file writer and must be kept alive for the
/// whole program.
pub fn init() -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match std::env::var("LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lightsheet_controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .boxed();
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}
