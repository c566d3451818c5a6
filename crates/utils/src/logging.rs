//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable overriding the log file destination.
pub const LOG_PATH_ENV_VAR: &str = "METRICS_EXPORTER_LOG_PATH";

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Builds the formatting layer shared by all binaries.
///
/// Without a log path events go to stderr. With one they go to a daily
/// rolling file next to it, and the returned guard must be kept alive to flush
/// the background writer.
pub fn get_fmt_layer<S>(log_path: Option<&Path>) -> (BoxedLayer<S>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path else {
        let stderr_layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed();
        return (stderr_layer, None);
    };

    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("metrics-exporter.log");

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (file_layer, Some(guard))
        }
        Err(e) => {
            eprintln!(
                "failed to create log file in {}: {e}, logging to stderr",
                dir.display()
            );
            let stderr_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed();
            (stderr_layer, None)
        }
    }
}
