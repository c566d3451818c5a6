//! Pull backend serving the latest report in the Prometheus text format

use std::collections::BTreeSet;
use std::sync::RwLock;

use async_trait::async_trait;
use error_stack::Report;
use prometheus::CounterVec;
use prometheus::GaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;
use tracing::warn;

use crate::exporter::ExportError;
use crate::exporter::MetricsExporter;
use crate::pull_server::ScrapeHandler;
use crate::view::Aggregation;
use crate::view::Row;
use crate::view::ViewData;

/// Keeps the last exported snapshot and encodes it on scrape.
pub struct PrometheusExporter {
    namespace: String,
    latest: RwLock<Vec<ViewData>>,
}

impl PrometheusExporter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            latest: RwLock::new(Vec::new()),
        }
    }

    /// Encodes the latest snapshot.
    ///
    /// Every view becomes one metric family under the exporter namespace.
    /// Views whose names or tag keys collide once sanitized are skipped.
    pub fn render(&self) -> String {
        let latest = self.latest.read().expect("should not be poisoned");
        let registry = Registry::new();
        let namespace = sanitize(&self.namespace);
        for data in latest.iter() {
            if let Err(e) = register_view(&registry, &namespace, data) {
                warn!(
                    namespace = %self.namespace,
                    view = %data.view.name,
                    "Skipping view on scrape: {e}"
                );
            }
        }

        match TextEncoder::new().encode_to_string(&registry.gather()) {
            Ok(body) => body,
            Err(e) => {
                error!(namespace = %self.namespace, "Failed to encode metrics: {e}");
                String::new()
            }
        }
    }
}

#[async_trait]
impl MetricsExporter for PrometheusExporter {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn export(&self, data: &[ViewData]) -> Result<(), Report<ExportError>> {
        *self.latest.write().expect("should not be poisoned") = data.to_vec();
        Ok(())
    }
}

impl ScrapeHandler for PrometheusExporter {
    fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    fn scrape(&self) -> String {
        self.render()
    }
}

fn register_view(registry: &Registry, namespace: &str, data: &ViewData) -> prometheus::Result<()> {
    let tag_keys: Vec<&str> = data
        .rows
        .iter()
        .flat_map(|row| row.tags.iter().map(|tag| tag.key.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let label_names: Vec<String> = tag_keys.iter().map(|key| sanitize(key)).collect();
    let label_names: Vec<&str> = label_names.iter().map(String::as_str).collect();

    // the registry refuses an empty help string
    let help = if data.view.description.is_empty() {
        data.view.name.clone()
    } else {
        data.view.description.clone()
    };
    let opts = Opts::new(sanitize(&data.view.name), help).namespace(namespace);

    match data.view.aggregation {
        Aggregation::Sum => {
            let counters = CounterVec::new(opts, &label_names)?;
            registry.register(Box::new(counters.clone()))?;
            for row in &data.rows {
                if !(row.value >= 0.0) {
                    warn!(view = %data.view.name, value = row.value, "Dropping non-monotonic counter row");
                    continue;
                }
                counters
                    .get_metric_with_label_values(&label_values(&tag_keys, row))?
                    .inc_by(row.value);
            }
        }
        Aggregation::LastValue => {
            let gauges = GaugeVec::new(opts, &label_names)?;
            registry.register(Box::new(gauges.clone()))?;
            for row in &data.rows {
                gauges
                    .get_metric_with_label_values(&label_values(&tag_keys, row))?
                    .set(row.value);
            }
        }
    }
    Ok(())
}

/// Values of `keys` in `row`, empty for keys the row does not carry.
fn label_values<'a>(keys: &[&str], row: &'a Row) -> Vec<&'a str> {
    keys.iter()
        .map(|key| {
            row.tags
                .iter()
                .find(|tag| tag.key == *key)
                .map_or("", |tag| tag.value.as_str())
        })
        .collect()
}

/// Replaces characters not allowed in metric and label names.
fn sanitize(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}
