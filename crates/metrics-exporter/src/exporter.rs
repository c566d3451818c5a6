//! Exporter abstraction shared by the reporting subsystem and the backends

use core::error::Error;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;

use crate::view::ViewData;

/// Errors raised while transmitting a report to a backend.
#[derive(Debug, derive_more::Display)]
pub enum ExportError {
    #[display("Request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[display("Backend rejected report with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl Error for ExportError {}

/// A component that transmits aggregated view data to a destination.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Export one reporting interval worth of view data.
    async fn export(&self, data: &[ViewData]) -> Result<(), Report<ExportError>>;
}

static NEXT_EXPORTER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a running exporter.
///
/// Clones share the same identity; two handles compare equal only when they
/// were cloned from the same [`ExporterHandle::new`] call.
#[derive(Clone)]
pub struct ExporterHandle {
    id: u64,
    exporter: Arc<dyn MetricsExporter>,
}

impl ExporterHandle {
    pub fn new(exporter: Arc<dyn MetricsExporter>) -> Self {
        Self {
            id: NEXT_EXPORTER_ID.fetch_add(1, Ordering::Relaxed),
            exporter,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.exporter.name()
    }

    pub async fn export(&self, data: &[ViewData]) -> Result<(), Report<ExportError>> {
        self.exporter.export(data).await
    }
}

impl PartialEq for ExporterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExporterHandle {}

impl fmt::Debug for ExporterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterHandle")
            .field("id", &self.id)
            .field("name", &self.exporter.name())
            .finish()
    }
}
