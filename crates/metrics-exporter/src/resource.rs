//! Monitored resource resolution
//!
//! Push backends attribute every reported row to a [`MonitoredResource`]. The
//! strategy is picked once, from the first push configuration, and kept for
//! the lifetime of the registry unless explicitly reset.

use std::env;
use std::sync::Arc;

use api_types::ExporterConfig;
use api_types::MonitoredResource;
use api_types::PlatformMetadata;
use api_types::Tag;
use api_types::VALUE_UNKNOWN;
use tracing::debug;
use tracing::info;

use crate::view::View;

/// Maps a view and its row tags to the tags to keep and the resource to attach.
pub type ResourceResolverFn =
    Arc<dyn Fn(&View, Vec<Tag>) -> (Vec<Tag>, MonitoredResource) + Send + Sync>;

/// Metric prefixes reported on behalf of a serving revision.
pub const REVISION_METRIC_PREFIXES: [&str; 2] = [
    "knative.dev/serving/autoscaler",
    "knative.dev/serving/activator",
];

pub const LABEL_NAMESPACE_NAME: &str = "namespace_name";
pub const LABEL_SERVICE_NAME: &str = "service_name";
pub const LABEL_CONFIGURATION_NAME: &str = "configuration_name";
pub const LABEL_REVISION_NAME: &str = "revision_name";

pub const PROJECT_ID_ENV_VAR: &str = "GCP_PROJECT_ID";
pub const CLUSTER_NAME_ENV_VAR: &str = "CLUSTER_NAME";
pub const CLUSTER_LOCATION_ENV_VAR: &str = "CLUSTER_LOCATION";

/// Source of the platform metadata captured by revision resolvers.
pub trait PlatformMetadataProvider: Send + Sync {
    fn retrieve(&self) -> PlatformMetadata;
}

impl PlatformMetadataProvider for PlatformMetadata {
    fn retrieve(&self) -> PlatformMetadata {
        self.clone()
    }
}

/// Reads platform metadata from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvMetadataProvider;

impl PlatformMetadataProvider for EnvMetadataProvider {
    fn retrieve(&self) -> PlatformMetadata {
        let read = |name: &str| {
            env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| VALUE_UNKNOWN.to_string())
        };
        PlatformMetadata {
            project: read(PROJECT_ID_ENV_VAR),
            cluster: read(CLUSTER_NAME_ENV_VAR),
            location: read(CLUSTER_LOCATION_ENV_VAR),
        }
    }
}

pub fn is_revision_prefix(prefix: &str) -> bool {
    REVISION_METRIC_PREFIXES.contains(&prefix)
}

/// Chooses and memoizes the resolution strategy.
#[derive(Clone)]
pub struct ResourceResolver {
    metadata: Arc<dyn PlatformMetadataProvider>,
}

impl ResourceResolver {
    pub fn new(metadata: Arc<dyn PlatformMetadataProvider>) -> Self {
        Self { metadata }
    }

    /// Metadata of the platform the process runs on.
    pub fn platform_metadata(&self) -> PlatformMetadata {
        self.metadata.retrieve()
    }

    /// Fills `slot` with the strategy for `config` unless it is already set,
    /// and returns whatever the slot holds afterwards.
    pub fn establish_once(
        &self,
        slot: &mut Option<ResourceResolverFn>,
        config: &ExporterConfig,
    ) -> ResourceResolverFn {
        if let Some(resolver) = slot {
            debug!(
                metric_prefix = %config.metric_prefix(),
                "Monitored resource resolver already established"
            );
            return resolver.clone();
        }
        slot.insert(self.strategy_for(config)).clone()
    }

    /// Strategy for `config`, without memoization.
    pub fn strategy_for(&self, config: &ExporterConfig) -> ResourceResolverFn {
        let metric_prefix = config.metric_prefix();
        if is_revision_prefix(&metric_prefix) {
            info!(%metric_prefix, "Attributing metrics to the revision container resource");
            revision_resource_resolver(self.metadata.retrieve())
        } else {
            info!(%metric_prefix, "Attributing metrics to the global resource");
            global_resource_resolver()
        }
    }
}

/// Resolver attributing every row to the global resource.
pub fn global_resource_resolver() -> ResourceResolverFn {
    Arc::new(|_view: &View, tags: Vec<Tag>| (tags, MonitoredResource::Global))
}

/// Resolver attributing every row to the container running the revision.
///
/// Revision identity tags are moved out of the row into the resource:
/// namespace → namespace id, service → container name, configuration →
/// instance id, revision → pod id. Identity tags missing from a row resolve
/// to `unknown`.
pub fn revision_resource_resolver(metadata: PlatformMetadata) -> ResourceResolverFn {
    Arc::new(move |_view: &View, tags: Vec<Tag>| {
        let mut namespace = None;
        let mut service = None;
        let mut configuration = None;
        let mut revision = None;
        let mut kept = Vec::with_capacity(tags.len());

        for tag in tags {
            match tag.key.as_str() {
                LABEL_NAMESPACE_NAME => namespace = Some(tag.value),
                LABEL_SERVICE_NAME => service = Some(tag.value),
                LABEL_CONFIGURATION_NAME => configuration = Some(tag.value),
                LABEL_REVISION_NAME => revision = Some(tag.value),
                _ => kept.push(tag),
            }
        }

        let or_unknown = |value: Option<String>| value.unwrap_or_else(|| VALUE_UNKNOWN.to_string());
        let resource = MonitoredResource::GkeContainer {
            project_id: metadata.project.clone(),
            cluster_name: metadata.cluster.clone(),
            zone: metadata.location.clone(),
            namespace_id: or_unknown(namespace),
            container_name: or_unknown(service),
            instance_id: or_unknown(configuration),
            pod_id: or_unknown(revision),
        };
        (kept, resource)
    })
}
