//! Exporter config from observability ConfigMap data

use core::error::Error;
use std::collections::BTreeMap;
use std::path::Path;

use api_types::BackendKind;
use api_types::ExporterConfig;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

pub const BACKEND_DESTINATION_KEY: &str = "metrics.backend-destination";
pub const STACKDRIVER_PROJECT_ID_KEY: &str = "metrics.stackdriver-project-id";

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Metrics domain must not be empty")]
    MissingDomain,
    #[display("Metrics component must not be empty")]
    MissingComponent,
    #[display("Unsupported metrics backend value {value:?}")]
    UnsupportedBackend { value: String },
    #[display("Failed to read config file {path}")]
    Read { path: String },
    #[display("Failed to parse config file {path}")]
    Parse { path: String },
    #[display("Failed to watch config file {path}")]
    Watch { path: String },
}

impl Error for ConfigError {}

/// Builds an exporter config from ConfigMap data.
///
/// The backend defaults to `prometheus` when unset and is matched ignoring
/// case.
pub fn exporter_config_from_map(
    data: &BTreeMap<String, String>,
    domain: &str,
    component: &str,
) -> Result<ExporterConfig, Report<ConfigError>> {
    if domain.is_empty() {
        return Err(Report::new(ConfigError::MissingDomain));
    }
    if component.is_empty() {
        return Err(Report::new(ConfigError::MissingComponent));
    }

    let backend = data
        .get(BACKEND_DESTINATION_KEY)
        .map(|raw| BackendKind::parse(raw.trim()))
        .unwrap_or(BackendKind::LocalPull);
    if let BackendKind::Unrecognized(value) = backend {
        return Err(Report::new(ConfigError::UnsupportedBackend { value }));
    }

    let mut config = ExporterConfig::new(backend, domain, component);
    if config.backend == BackendKind::CloudPush {
        if let Some(project_id) = data.get(STACKDRIVER_PROJECT_ID_KEY) {
            config.project_id = project_id.trim().to_string();
        }
    }
    Ok(config)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigMapFile {
    ConfigMap { data: BTreeMap<String, String> },
    Data(BTreeMap<String, String>),
}

/// Parses ConfigMap data from YAML or JSON text.
///
/// Accepts either a full ConfigMap manifest or the bare `data` map.
pub fn parse_config_map(contents: &str, path: &str) -> Result<BTreeMap<String, String>, Report<ConfigError>> {
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: ConfigMapFile = serde_yaml::from_str(contents).change_context(ConfigError::Parse {
        path: path.to_string(),
    })?;
    Ok(match file {
        ConfigMapFile::ConfigMap { data } | ConfigMapFile::Data(data) => data,
    })
}

pub fn load_config_map(path: &Path) -> Result<BTreeMap<String, String>, Report<ConfigError>> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).change_context(ConfigError::Read {
        path: display.clone(),
    })?;
    parse_config_map(&contents, &display)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn data(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_to_pull_backend() {
        let config = exporter_config_from_map(&BTreeMap::new(), "knative.dev/serving", "activator")
            .expect("should parse");

        assert_eq!(
            config,
            ExporterConfig::new(BackendKind::LocalPull, "knative.dev/serving", "activator")
        );
    }

    #[test]
    fn push_backend_reads_project_id() {
        let config = exporter_config_from_map(
            &data(&[
                (BACKEND_DESTINATION_KEY, "Stackdriver"),
                (STACKDRIVER_PROJECT_ID_KEY, "test-project"),
            ]),
            "knative.dev/serving",
            "autoscaler",
        )
        .expect("should parse");

        assert_eq!(config.backend, BackendKind::CloudPush);
        assert_eq!(config.project_id, "test-project");
    }

    #[test]
    fn pull_backend_ignores_project_id() {
        let config = exporter_config_from_map(
            &data(&[
                (BACKEND_DESTINATION_KEY, "prometheus"),
                (STACKDRIVER_PROJECT_ID_KEY, "test-project"),
            ]),
            "knative.dev/serving",
            "autoscaler",
        )
        .expect("should parse");

        assert_eq!(config.project_id, "");
    }

    #[test]
    fn rejects_invalid_input() {
        let unsupported = exporter_config_from_map(
            &data(&[(BACKEND_DESTINATION_KEY, "opencensus")]),
            "knative.dev/serving",
            "autoscaler",
        )
        .expect_err("should fail");
        assert_eq!(
            unsupported.current_context().to_string(),
            "Unsupported metrics backend value \"opencensus\""
        );

        let missing_domain = exporter_config_from_map(&BTreeMap::new(), "", "autoscaler")
            .expect_err("should fail");
        assert!(matches!(missing_domain.current_context(), ConfigError::MissingDomain));

        let missing_component = exporter_config_from_map(&BTreeMap::new(), "knative.dev/serving", "")
            .expect_err("should fail");
        assert!(matches!(
            missing_component.current_context(),
            ConfigError::MissingComponent
        ));
    }

    #[test]
    fn parses_manifest_and_bare_data() {
        let manifest = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: config-observability
data:
  metrics.backend-destination: stackdriver
  metrics.stackdriver-project-id: test-project
"#;
        let bare = r#"{"metrics.backend-destination": "prometheus"}"#;

        let from_manifest = parse_config_map(manifest, "manifest.yaml").expect("should parse");
        let from_bare = parse_config_map(bare, "bare.json").expect("should parse");

        assert_eq!(from_manifest.get(BACKEND_DESTINATION_KEY).map(String::as_str), Some("stackdriver"));
        assert_eq!(from_bare.get(BACKEND_DESTINATION_KEY).map(String::as_str), Some("prometheus"));
        assert!(parse_config_map("", "empty.yaml").expect("should parse").is_empty());
        assert!(parse_config_map("- a\n- b\n", "list.yaml").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let report = load_config_map(Path::new("/nonexistent/config.yaml")).expect_err("should fail");
        assert!(matches!(report.current_context(), ConfigError::Read { .. }));
    }
}
