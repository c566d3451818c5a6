//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Registry;

/// initiate the global tracing subscriber
///
/// The returned guard flushes the file writer on drop and must outlive the daemon.
pub fn init(log_path: Option<&Path>) -> Option<WorkerGuard> {
    let (fmt_layer, guard) = utils::logging::get_fmt_layer::<Registry>(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
