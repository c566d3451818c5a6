//! Owner of the active exporter
//!
//! [`ExporterRegistry`] keeps the exporter registered with the reporting
//! subsystem, the config it was built from, the pull server serving it and the
//! memoized resource resolver. Every read and transition goes through a single
//! lock, so at most one exporter is registered and at most one pull listener
//! is bound at any time.

use core::error::Error;
use std::sync::Arc;
use std::time::Duration;

use api_types::ExporterConfig;
use error_stack::Report;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::exporter::ExporterHandle;
use crate::factory::BackendExporterFactory;
use crate::factory::BuildError;
use crate::pull_server::PullServerHandle;
use crate::pull_server::PullServerInfo;
use crate::resource::ResourceResolverFn;
use crate::view::ReportingSubsystem;

/// Interval between two reports once an exporter is active.
pub const REPORTING_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, derive_more::Display)]
pub enum ReconfigError {
    #[display("Unsupported metrics backend {kind}")]
    UnsupportedBackendKind { kind: String },
    #[display("Failed to construct the {backend} exporter")]
    ExporterConstructionFailed { backend: String },
}

impl Error for ReconfigError {}

#[derive(Default)]
struct RegistryState {
    exporter: Option<ExporterHandle>,
    config: Option<ExporterConfig>,
    pull_server: Option<PullServerHandle>,
    resource_resolver: Option<ResourceResolverFn>,
}

pub struct ExporterRegistry {
    state: Mutex<RegistryState>,
    reporting: Arc<dyn ReportingSubsystem>,
    factory: BackendExporterFactory,
}

impl ExporterRegistry {
    pub fn new(reporting: Arc<dyn ReportingSubsystem>, factory: BackendExporterFactory) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            reporting,
            factory,
        }
    }

    /// Swaps the active exporter for one built from `config`.
    ///
    /// Returns the previously committed config. Unrecognized backends are
    /// rejected before anything is torn down. A construction failure leaves
    /// no exporter and no pull server active while the committed config stays
    /// at the last successful one.
    ///
    /// # Errors
    ///
    /// - [`ReconfigError::UnsupportedBackendKind`] if the backend is not recognized
    /// - [`ReconfigError::ExporterConstructionFailed`] if the backend could not be built
    pub async fn reconfigure(
        &self,
        config: ExporterConfig,
    ) -> Result<Option<ExporterConfig>, Report<ReconfigError>> {
        if !config.backend.is_supported() {
            error!(%config, "Rejecting unsupported metrics backend");
            return Err(Report::new(ReconfigError::UnsupportedBackendKind {
                kind: config.backend.to_string(),
            }));
        }

        let mut state = self.state.lock().await;
        let state = &mut *state;

        if let Some(mut pull_server) = state.pull_server.take() {
            debug!(listen_addr = pull_server.listen_addr(), "Stopping the running pull server");
            pull_server.shutdown().await;
        }
        if let Some(exporter) = state.exporter.take() {
            debug!(
                exporter_id = exporter.id(),
                exporter = exporter.name(),
                "Unregistering the previous exporter"
            );
            self.reporting.unregister_exporter(&exporter);
        }

        let built = match self.factory.build(&config, &mut state.resource_resolver) {
            Ok(built) => built,
            Err(report) => {
                error!(%config, "Failed to update the metrics exporter: {report:?}");
                let reconfig_error = match report.current_context() {
                    BuildError::UnsupportedBackendKind { kind } => {
                        ReconfigError::UnsupportedBackendKind { kind: kind.clone() }
                    }
                    BuildError::ExporterConstruction { backend, .. } => {
                        ReconfigError::ExporterConstructionFailed {
                            backend: backend.clone(),
                        }
                    }
                };
                return Err(report.change_context(reconfig_error));
            }
        };

        self.reporting.register_exporter(built.exporter.clone());
        self.reporting.set_reporting_period(REPORTING_PERIOD);
        state.exporter = Some(built.exporter);
        state.pull_server = built.pull_server;
        let previous = state.config.replace(config);

        info!(
            exporter_id = state.exporter.as_ref().map(ExporterHandle::id),
            old = ?previous.as_ref().map(ToString::to_string),
            new = %state.config.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Successfully updated the metrics exporter"
        );
        Ok(previous)
    }

    pub async fn current_exporter(&self) -> Option<ExporterHandle> {
        self.state.lock().await.exporter.clone()
    }

    pub async fn current_config(&self) -> Option<ExporterConfig> {
        self.state.lock().await.config.clone()
    }

    pub async fn current_pull_server(&self) -> Option<PullServerInfo> {
        self.state
            .lock()
            .await
            .pull_server
            .as_ref()
            .map(PullServerHandle::info)
    }

    /// Currently established resource resolver, if any push backend was configured.
    pub async fn current_resource_resolver(&self) -> Option<ResourceResolverFn> {
        self.state.lock().await.resource_resolver.clone()
    }

    /// Forgets the memoized resource resolver so the next push configuration
    /// picks a new strategy. The active exporter keeps the one it was built with.
    pub async fn reset_resource_resolver(&self) {
        if self.state.lock().await.resource_resolver.take().is_some() {
            info!("Cleared the monitored resource resolver");
        }
    }

    /// Stops the pull server and unregisters the exporter. The committed
    /// config is kept. Idempotent.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut pull_server) = state.pull_server.take() {
            pull_server.shutdown().await;
        }
        if let Some(exporter) = state.exporter.take() {
            self.reporting.unregister_exporter(&exporter);
            info!(
                exporter_id = exporter.id(),
                exporter = exporter.name(),
                "Metrics exporter shut down"
            );
        }
    }
}
