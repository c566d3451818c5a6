//! In-process reporting subsystem
//!
//! Views are recorded into a [`ViewRegistry`], which periodically hands a
//! snapshot of every view to the registered exporters. The exporter registry
//! only talks to it through the [`ReportingSubsystem`] trait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::SystemTime;

use api_types::Tag;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::exporter::ExporterHandle;

/// How recorded measurements of a view are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    LastValue,
}

/// A named definition of what is measured and how it is aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub name: String,
    pub description: String,
    pub aggregation: Aggregation,
}

impl View {
    pub fn new(name: impl Into<String>, description: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            aggregation,
        }
    }
}

/// Aggregated value of one tag combination.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub tags: Vec<Tag>,
    pub value: f64,
}

/// Snapshot of a view handed to exporters.
#[derive(Debug, Clone)]
pub struct ViewData {
    pub view: Arc<View>,
    pub rows: Vec<Row>,
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Operations the exporter registry needs from the reporting subsystem.
pub trait ReportingSubsystem: Send + Sync {
    /// Registers an exporter. Registering the same handle twice is a no-op.
    fn register_exporter(&self, exporter: ExporterHandle);

    /// Unregisters an exporter. Unknown handles are ignored.
    fn unregister_exporter(&self, exporter: &ExporterHandle);

    /// Sets the interval between two exports.
    fn set_reporting_period(&self, period: Duration);
}

pub const DEFAULT_REPORTING_PERIOD: Duration = Duration::from_secs(10);

struct ViewEntry {
    view: Arc<View>,
    rows: BTreeMap<Vec<Tag>, f64>,
}

struct ViewRegistryState {
    exporters: Vec<ExporterHandle>,
    period: Duration,
    views: BTreeMap<String, ViewEntry>,
    start: SystemTime,
}

/// Registry of views and exporters.
pub struct ViewRegistry {
    state: RwLock<ViewRegistryState>,
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ViewRegistryState {
                exporters: Vec::new(),
                period: DEFAULT_REPORTING_PERIOD,
                views: BTreeMap::new(),
                start: SystemTime::now(),
            }),
        }
    }

    pub fn registered_exporters(&self) -> Vec<ExporterHandle> {
        self.state
            .read()
            .expect("should not be poisoned")
            .exporters
            .clone()
    }

    pub fn reporting_period(&self) -> Duration {
        self.state.read().expect("should not be poisoned").period
    }

    /// Records a measurement. Tags are sorted so that the same set in any
    /// order lands in the same row.
    pub fn record(&self, view: &Arc<View>, mut tags: Vec<Tag>, value: f64) {
        tags.sort();
        let mut state = self.state.write().expect("should not be poisoned");
        let entry = state
            .views
            .entry(view.name.clone())
            .or_insert_with(|| ViewEntry {
                view: view.clone(),
                rows: BTreeMap::new(),
            });
        let row = entry.rows.entry(tags).or_insert(0.0);
        match view.aggregation {
            Aggregation::Sum => *row += value,
            Aggregation::LastValue => *row = value,
        }
    }

    /// Current state of every recorded view.
    pub fn snapshot(&self) -> Vec<ViewData> {
        let state = self.state.read().expect("should not be poisoned");
        let end = SystemTime::now();
        state
            .views
            .values()
            .map(|entry| ViewData {
                view: entry.view.clone(),
                rows: entry
                    .rows
                    .iter()
                    .map(|(tags, value)| Row {
                        tags: tags.clone(),
                        value: *value,
                    })
                    .collect(),
                start: state.start,
                end,
            })
            .collect()
    }

    /// Exports the current snapshot to every registered exporter and returns
    /// the number of exporters that failed.
    pub async fn flush(&self) -> usize {
        let exporters = self.registered_exporters();
        if exporters.is_empty() {
            return 0;
        }
        let data = self.snapshot();

        let mut failures = 0;
        for exporter in exporters {
            if let Err(report) = exporter.export(&data).await {
                failures += 1;
                error!(exporter = exporter.name(), "Failed to export metrics: {report:?}");
            }
        }
        failures
    }

    /// Flushes on every reporting period until cancelled.
    ///
    /// The period is re-read after each flush so that changes made through
    /// [`ReportingSubsystem::set_reporting_period`] take effect on the next tick.
    pub async fn run_reporter(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!("Starting metrics reporter");
        loop {
            let period = self.reporting_period();
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Metrics reporter shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(period) => {
                    let failures = self.flush().await;
                    debug!(failures, "Metrics reporting interval completed");
                }
            }
        }
    }
}

impl ReportingSubsystem for ViewRegistry {
    fn register_exporter(&self, exporter: ExporterHandle) {
        let mut state = self.state.write().expect("should not be poisoned");
        if !state.exporters.contains(&exporter) {
            state.exporters.push(exporter);
        }
    }

    fn unregister_exporter(&self, exporter: &ExporterHandle) {
        let mut state = self.state.write().expect("should not be poisoned");
        state.exporters.retain(|registered| registered != exporter);
    }

    fn set_reporting_period(&self, period: Duration) {
        self.state.write().expect("should not be poisoned").period = period;
    }
}
