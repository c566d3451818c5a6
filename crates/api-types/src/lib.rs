//! Shared type definitions
//!
//! This crate contains the value types exchanged between the config loader,
//! the exporter registry and the metric backends: the desired exporter
//! configuration, metric tags and the monitored resource a report is
//! attributed to.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Value reported for identity fields that could not be determined.
pub const VALUE_UNKNOWN: &str = "unknown";

/// Metrics backend an exporter should be built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendKind {
    /// Push-based export to the cloud monitoring service (`stackdriver`).
    CloudPush,
    /// Pull-based export through a local scrape endpoint (`prometheus`).
    LocalPull,
    /// Any other value passed through by the config source.
    Unrecognized(String),
}

impl BackendKind {
    pub const CLOUD_PUSH: &'static str = "stackdriver";
    pub const LOCAL_PULL: &'static str = "prometheus";

    /// Parses a backend name, ignoring ASCII case.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            Self::CLOUD_PUSH => BackendKind::CloudPush,
            Self::LOCAL_PULL => BackendKind::LocalPull,
            _ => BackendKind::Unrecognized(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackendKind::CloudPush => Self::CLOUD_PUSH,
            BackendKind::LocalPull => Self::LOCAL_PULL,
            BackendKind::Unrecognized(raw) => raw,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, BackendKind::Unrecognized(_))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for BackendKind {
    fn from(raw: String) -> Self {
        BackendKind::parse(&raw)
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Desired exporter configuration.
///
/// Produced by the config loader and treated as read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterConfig {
    pub backend: BackendKind,
    /// Metric domain, e.g. `knative.dev/serving`
    pub domain: String,
    /// Component emitting the metrics, e.g. `autoscaler`
    pub component: String,
    /// Cloud project the push backend writes to
    #[serde(default)]
    pub project_id: String,
}

impl ExporterConfig {
    pub fn new(backend: BackendKind, domain: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            backend,
            domain: domain.into(),
            component: component.into(),
            project_id: String::new(),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Metric prefix in the form `domain/component`.
    pub fn metric_prefix(&self) -> String {
        format!("{}/{}", self.domain, self.component)
    }
}

impl fmt::Display for ExporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backend={} domain={} component={} project_id={}",
            self.backend, self.domain, self.component, self.project_id
        )
    }
}

/// A key/value label attached to a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The entity a metric report is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoredResource {
    /// No specific resource.
    Global,
    /// A container workload running in a cluster.
    GkeContainer {
        project_id: String,
        cluster_name: String,
        zone: String,
        namespace_id: String,
        container_name: String,
        instance_id: String,
        pod_id: String,
    },
}

impl MonitoredResource {
    /// Monitored resource type name as understood by the cloud backend.
    pub fn type_name(&self) -> &'static str {
        match self {
            MonitoredResource::Global => "global",
            MonitoredResource::GkeContainer { .. } => "gke_container",
        }
    }

    /// Resource labels in the backend's wire naming.
    pub fn labels(&self) -> Vec<(&'static str, &str)> {
        match self {
            MonitoredResource::Global => Vec::new(),
            MonitoredResource::GkeContainer {
                project_id,
                cluster_name,
                zone,
                namespace_id,
                container_name,
                instance_id,
                pod_id,
            } => vec![
                ("project_id", project_id.as_str()),
                ("cluster_name", cluster_name.as_str()),
                ("zone", zone.as_str()),
                ("namespace_id", namespace_id.as_str()),
                ("container_name", container_name.as_str()),
                ("instance_id", instance_id.as_str()),
                ("pod_id", pod_id.as_str()),
            ],
        }
    }
}

/// Metadata describing where the process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub project: String,
    pub cluster: String,
    pub location: String,
}

impl Default for PlatformMetadata {
    fn default() -> Self {
        Self {
            project: VALUE_UNKNOWN.to_string(),
            cluster: VALUE_UNKNOWN.to_string(),
            location: VALUE_UNKNOWN.to_string(),
        }
    }
}
