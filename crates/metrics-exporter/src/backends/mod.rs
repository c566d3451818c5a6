//! Concrete exporter backends

pub mod cloud_monitoring;
pub mod prometheus;

pub use self::cloud_monitoring::CloudMonitoringBuilder;
pub use self::cloud_monitoring::CloudMonitoringExporter;
pub use self::prometheus::PrometheusExporter;
