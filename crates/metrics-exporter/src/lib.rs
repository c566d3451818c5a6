//! Metrics exporter lifecycle management
//!
//! Keeps exactly one metrics exporter active for a component, swapping it
//! whenever the observability config changes. Push backends write to the cloud
//! monitoring API; pull backends serve the latest report on a scrape endpoint.

pub mod app;
pub mod backends;
pub mod config;
pub mod exporter;
pub mod factory;
pub mod logging;
pub mod pull_server;
pub mod registry;
pub mod resource;
pub mod view;
pub mod watcher;

pub use exporter::ExporterHandle;
pub use exporter::MetricsExporter;
pub use factory::BackendExporterFactory;
pub use registry::ExporterRegistry;
pub use registry::ReconfigError;
