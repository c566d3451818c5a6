//! Builds the exporter requested by a configuration

use core::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::BackendKind;
use api_types::ExporterConfig;
use api_types::VALUE_UNKNOWN;
use error_stack::Report;
use tracing::error;
use tracing::info;

use crate::backends::PrometheusExporter;
use crate::exporter::ExporterHandle;
use crate::pull_server::PullServerController;
use crate::pull_server::PullServerHandle;
use crate::resource::ResourceResolver;
use crate::resource::ResourceResolverFn;

#[derive(Debug, derive_more::Display)]
pub enum BuildError {
    #[display("Unsupported metrics backend {kind}")]
    UnsupportedBackendKind { kind: String },
    #[display("Failed to create the {backend} exporter: {message}")]
    ExporterConstruction { backend: String, message: String },
}

impl Error for BuildError {}

/// Settings handed to a push exporter.
#[derive(Clone)]
pub struct PushExporterOptions {
    pub project_id: String,
    /// `domain/component`
    pub metric_prefix: String,
    pub resource_resolver: ResourceResolverFn,
    pub default_labels: BTreeMap<String, String>,
}

/// Constructs push exporters.
pub trait PushExporterBuilder: Send + Sync {
    fn build(&self, options: PushExporterOptions) -> Result<ExporterHandle, Report<BuildError>>;
}

/// Result of a successful build.
pub struct BuiltExporter {
    pub exporter: ExporterHandle,
    /// Listener started for pull backends.
    pub pull_server: Option<PullServerHandle>,
}

pub struct BackendExporterFactory {
    resource_resolver: ResourceResolver,
    push_builder: Arc<dyn PushExporterBuilder>,
    pull_servers: PullServerController,
}

impl BackendExporterFactory {
    pub fn new(
        resource_resolver: ResourceResolver,
        push_builder: Arc<dyn PushExporterBuilder>,
        pull_servers: PullServerController,
    ) -> Self {
        Self {
            resource_resolver,
            push_builder,
            pull_servers,
        }
    }

    /// Project the push exporter writes to. Falls back to the platform
    /// project when the config names none.
    fn push_project_id(&self, config: &ExporterConfig) -> String {
        if !config.project_id.is_empty() {
            return config.project_id.clone();
        }
        let project = self.resource_resolver.platform_metadata().project;
        if project == VALUE_UNKNOWN {
            return String::new();
        }
        info!(%config, %project, "Using the platform project for the push exporter");
        project
    }

    /// Builds the exporter for `config`.
    ///
    /// Push backends establish the resource resolver in `resolver_slot` first
    /// if it is still empty. Pull backends start their listener in the
    /// background; a bind failure there does not fail the build.
    pub fn build(
        &self,
        config: &ExporterConfig,
        resolver_slot: &mut Option<ResourceResolverFn>,
    ) -> Result<BuiltExporter, Report<BuildError>> {
        match &config.backend {
            BackendKind::CloudPush => {
                let resource_resolver = self.resource_resolver.establish_once(resolver_slot, config);
                let exporter = self
                    .push_builder
                    .build(PushExporterOptions {
                        project_id: self.push_project_id(config),
                        metric_prefix: config.metric_prefix(),
                        resource_resolver,
                        default_labels: BTreeMap::new(),
                    })
                    .inspect_err(|report| {
                        error!(%config, "Failed to create the push exporter: {report:?}");
                    })?;
                info!(%config, "Created push exporter");
                Ok(BuiltExporter {
                    exporter,
                    pull_server: None,
                })
            }
            BackendKind::LocalPull => {
                let exporter = Arc::new(PrometheusExporter::new(config.component.clone()));
                info!(
                    %config,
                    listen_addr = self.pull_servers.listen_addr(),
                    "Created pull exporter, starting the scrape endpoint"
                );
                let pull_server = self.pull_servers.start(exporter.clone());
                Ok(BuiltExporter {
                    exporter: ExporterHandle::new(exporter),
                    pull_server: Some(pull_server),
                })
            }
            BackendKind::Unrecognized(kind) => Err(Report::new(BuildError::UnsupportedBackendKind {
                kind: kind.clone(),
            })),
        }
    }
}
