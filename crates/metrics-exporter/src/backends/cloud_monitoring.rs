//! Push backend writing time series to the cloud monitoring API

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use tracing::debug;

use crate::exporter::ExportError;
use crate::exporter::ExporterHandle;
use crate::exporter::MetricsExporter;
use crate::factory::BuildError;
use crate::factory::PushExporterBuilder;
use crate::factory::PushExporterOptions;
use crate::view::Aggregation;
use crate::view::ViewData;

pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com/v3";
pub const CUSTOM_METRIC_DOMAIN: &str = "custom.googleapis.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound the API accepts per `timeSeries.create` call.
const MAX_TIME_SERIES_PER_REQUEST: usize = 200;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest {
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeries {
    metric: Metric,
    resource: Resource,
    metric_kind: &'static str,
    value_type: &'static str,
    points: Vec<Point>,
}

#[derive(Debug, Serialize)]
struct Metric {
    #[serde(rename = "type")]
    metric_type: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Resource {
    #[serde(rename = "type")]
    resource_type: &'static str,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Point {
    interval: Interval,
    value: TypedValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Interval {
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: f64,
}

/// Exporter pushing every report to the cloud monitoring service.
pub struct CloudMonitoringExporter {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
    options: PushExporterOptions,
}

impl CloudMonitoringExporter {
    fn time_series(&self, data: &[ViewData]) -> Vec<TimeSeries> {
        let mut series = Vec::new();
        for view_data in data {
            let metric_type = format!(
                "{CUSTOM_METRIC_DOMAIN}/{}/{}",
                self.options.metric_prefix, view_data.view.name
            );
            let (metric_kind, start_time) = match view_data.view.aggregation {
                Aggregation::Sum => ("CUMULATIVE", Some(DateTime::<Utc>::from(view_data.start))),
                Aggregation::LastValue => ("GAUGE", None),
            };
            let end_time = DateTime::<Utc>::from(view_data.end);

            for row in &view_data.rows {
                let (tags, resource) =
                    (self.options.resource_resolver)(view_data.view.as_ref(), row.tags.clone());

                let mut labels = self.options.default_labels.clone();
                labels.extend(tags.into_iter().map(|tag| (tag.key, tag.value)));

                series.push(TimeSeries {
                    metric: Metric {
                        metric_type: metric_type.clone(),
                        labels,
                    },
                    resource: Resource {
                        resource_type: resource.type_name(),
                        labels: resource
                            .labels()
                            .into_iter()
                            .map(|(key, value)| (key.to_string(), value.to_string()))
                            .collect(),
                    },
                    metric_kind,
                    value_type: "DOUBLE",
                    points: vec![Point {
                        interval: Interval {
                            start_time,
                            end_time,
                        },
                        value: TypedValue {
                            double_value: row.value,
                        },
                    }],
                });
            }
        }
        series
    }
}

#[async_trait]
impl MetricsExporter for CloudMonitoringExporter {
    fn name(&self) -> &str {
        "stackdriver"
    }

    async fn export(&self, data: &[ViewData]) -> Result<(), Report<ExportError>> {
        let series = self.time_series(data);
        if series.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/projects/{}/timeSeries",
            self.endpoint.trim_end_matches('/'),
            self.options.project_id
        );

        let mut batches = series.into_iter().peekable();
        while batches.peek().is_some() {
            let batch: Vec<TimeSeries> = batches.by_ref().take(MAX_TIME_SERIES_PER_REQUEST).collect();
            let count = batch.len();
            let mut request = self
                .client
                .post(&url)
                .json(&CreateTimeSeriesRequest { time_series: batch });
            if let Some(token) = &self.access_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.change_context(ExportError::Request {
                url: url.clone(),
                message: "failed to send time series".to_string(),
            })?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Report::new(ExportError::Rejected {
                    status: status.as_u16(),
                    body,
                }));
            }
            debug!(count, project_id = %self.options.project_id, "Pushed time series");
        }
        Ok(())
    }
}

/// Builds [`CloudMonitoringExporter`]s.
#[derive(Debug, Clone)]
pub struct CloudMonitoringBuilder {
    endpoint: String,
    access_token: Option<String>,
}

impl Default for CloudMonitoringBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl CloudMonitoringBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token.filter(|token| !token.is_empty());
        self
    }
}

impl PushExporterBuilder for CloudMonitoringBuilder {
    fn build(&self, options: PushExporterOptions) -> Result<ExporterHandle, Report<BuildError>> {
        validate_project_id(&options.project_id)?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .change_context(BuildError::ExporterConstruction {
                backend: "stackdriver".to_string(),
                message: "failed to create HTTP client".to_string(),
            })?;

        Ok(ExporterHandle::new(Arc::new(CloudMonitoringExporter {
            client,
            endpoint: self.endpoint.clone(),
            access_token: self.access_token.clone(),
            options,
        })))
    }
}

/// Checks the project id syntax: 6 to 30 characters, starting with a
/// lowercase letter, made of lowercase letters, digits and hyphens, and not
/// ending with a hyphen.
pub fn validate_project_id(project_id: &str) -> Result<(), Report<BuildError>> {
    let invalid = |reason: &str| {
        Report::new(BuildError::ExporterConstruction {
            backend: "stackdriver".to_string(),
            message: format!("invalid project id {project_id:?}: {reason}"),
        })
    };

    if !(6..=30).contains(&project_id.len()) {
        return Err(invalid("must be 6 to 30 characters long"));
    }
    if !project_id.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(invalid("must start with a lowercase letter"));
    }
    if !project_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("may only contain lowercase letters, digits and hyphens"));
    }
    if project_id.ends_with('-') {
        return Err(invalid("must not end with a hyphen"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::SystemTime;

    use api_types::PlatformMetadata;
    use api_types::Tag;
    use poem::handler;
    use poem::http::StatusCode;
    use poem::listener::TcpAcceptor;
    use poem::web::Data;
    use poem::web::Json;
    use poem::EndpointExt;
    use poem::Request;
    use poem::Response;
    use poem::Route;
    use poem::Server;

    use super::*;
    use crate::resource::global_resource_resolver;
    use crate::resource::revision_resource_resolver;
    use crate::resource::ResourceResolverFn;
    use crate::view::Row;
    use crate::view::View;

    fn options(resolver: ResourceResolverFn) -> PushExporterOptions {
        PushExporterOptions {
            project_id: "test-project".to_string(),
            metric_prefix: "knative.dev/serving/autoscaler".to_string(),
            resource_resolver: resolver,
            default_labels: BTreeMap::new(),
        }
    }

    fn exporter(resolver: ResourceResolverFn) -> CloudMonitoringExporter {
        CloudMonitoringExporter {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            access_token: None,
            options: options(resolver),
        }
    }

    fn data() -> Vec<ViewData> {
        vec![ViewData {
            view: Arc::new(View::new("desired_pods", "", Aggregation::LastValue)),
            rows: vec![Row {
                tags: vec![
                    Tag::new("revision_name", "hello-00001"),
                    Tag::new("code", "200"),
                ],
                value: 2.0,
            }],
            start: SystemTime::UNIX_EPOCH,
            end: SystemTime::UNIX_EPOCH,
        }]
    }

    #[test]
    fn project_id_validation() {
        assert!(validate_project_id("my-project-123").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("short").is_err());
        assert!(validate_project_id("1-starts-with-digit").is_err());
        assert!(validate_project_id("Upper-Case").is_err());
        assert!(validate_project_id("trailing-hyphen-").is_err());
    }

    #[test]
    fn builder_rejects_invalid_project() {
        let result = CloudMonitoringBuilder::default().build(PushExporterOptions {
            project_id: "BAD PROJECT".to_string(),
            ..options(global_resource_resolver())
        });

        let report = result.expect_err("build should fail");
        assert!(matches!(
            report.current_context(),
            BuildError::ExporterConstruction { .. }
        ));
    }

    #[test]
    fn time_series_carry_resolved_resource() {
        let metadata = PlatformMetadata {
            project: "test-project".to_string(),
            cluster: "cluster".to_string(),
            location: "zone".to_string(),
        };
        let series = exporter(revision_resource_resolver(metadata)).time_series(&data());

        let json = serde_json::to_value(&series).expect("should serialize");
        assert_eq!(
            json[0]["metric"]["type"],
            "custom.googleapis.com/knative.dev/serving/autoscaler/desired_pods"
        );
        assert_eq!(json[0]["metric"]["labels"], serde_json::json!({"code": "200"}));
        assert_eq!(json[0]["resource"]["type"], "gke_container");
        assert_eq!(json[0]["resource"]["labels"]["pod_id"], "hello-00001");
        assert_eq!(json[0]["metricKind"], "GAUGE");
        assert_eq!(json[0]["points"][0]["value"]["doubleValue"], serde_json::json!(2.0));
        assert!(json[0]["points"][0]["interval"].get("startTime").is_none());
    }

    #[test]
    fn global_resource_keeps_all_tags() {
        let series = exporter(global_resource_resolver()).time_series(&data());

        let json = serde_json::to_value(&series).expect("should serialize");
        assert_eq!(json[0]["resource"]["type"], "global");
        assert_eq!(json[0]["metric"]["labels"]["revision_name"], "hello-00001");
    }

    #[tokio::test]
    async fn empty_report_sends_nothing() {
        let exporter = exporter(global_resource_resolver());
        assert!(exporter.export(&[]).await.is_ok());
    }

    /// Local stand-in for the monitoring API answering with a fixed status.
    struct FakeMonitoring {
        status: StatusCode,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct RecordedRequest {
        path: String,
        authorization: Option<String>,
        series: usize,
    }

    #[handler]
    fn create_time_series(
        req: &Request,
        Json(body): Json<serde_json::Value>,
        Data(fake): Data<&Arc<FakeMonitoring>>,
    ) -> Response {
        fake.requests
            .lock()
            .expect("should not be poisoned")
            .push(RecordedRequest {
                path: req.uri().path().to_string(),
                authorization: req
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string),
                series: body["timeSeries"].as_array().map_or(0, Vec::len),
            });
        Response::builder().status(fake.status).body("quota exceeded")
    }

    /// Serves the fake on an ephemeral port and returns its API base URL.
    fn serve_fake(fake: Arc<FakeMonitoring>) -> (String, tokio::task::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind ephemeral port");
        listener.set_nonblocking(true).expect("should set non-blocking");
        let addr = listener.local_addr().expect("should have local addr");
        let listener = tokio::net::TcpListener::from_std(listener).expect("should convert listener");
        let acceptor = TcpAcceptor::from_tokio(listener).expect("should create acceptor");

        let app = Route::new()
            .at("/v3/projects/test-project/timeSeries", poem::post(create_time_series))
            .data(fake);
        let server = tokio::spawn(async move {
            let _ = Server::new_with_acceptor(acceptor).run(app).await;
        });
        (format!("http://{addr}/v3"), server)
    }

    fn rows(count: usize) -> Vec<ViewData> {
        vec![ViewData {
            view: Arc::new(View::new("request_count", "", Aggregation::Sum)),
            rows: (0..count)
                .map(|i| Row {
                    tags: vec![Tag::new("route", i.to_string())],
                    value: 1.0,
                })
                .collect(),
            start: SystemTime::UNIX_EPOCH,
            end: SystemTime::now(),
        }]
    }

    fn push_exporter(endpoint: String) -> ExporterHandle {
        CloudMonitoringBuilder::new(endpoint)
            .with_access_token(Some("secret-token".to_string()))
            .build(options(global_resource_resolver()))
            .expect("build should succeed")
    }

    #[tokio::test]
    async fn export_posts_batches_with_bearer_token() {
        let fake = Arc::new(FakeMonitoring {
            status: StatusCode::OK,
            requests: Mutex::new(Vec::new()),
        });
        let (endpoint, server) = serve_fake(fake.clone());

        push_exporter(endpoint)
            .export(&rows(MAX_TIME_SERIES_PER_REQUEST + 1))
            .await
            .expect("export should succeed");

        let requests = fake.requests.lock().expect("should not be poisoned").clone();
        let expected = |series| RecordedRequest {
            path: "/v3/projects/test-project/timeSeries".to_string(),
            authorization: Some("Bearer secret-token".to_string()),
            series,
        };
        assert_eq!(requests, vec![expected(200), expected(1)]);
        server.abort();
    }

    #[tokio::test]
    async fn rejected_report_carries_status_and_body() {
        let fake = Arc::new(FakeMonitoring {
            status: StatusCode::TOO_MANY_REQUESTS,
            requests: Mutex::new(Vec::new()),
        });
        let (endpoint, server) = serve_fake(fake.clone());

        let report = push_exporter(endpoint)
            .export(&rows(3))
            .await
            .expect_err("export should fail");

        match report.current_context() {
            ExportError::Rejected { status, body } => {
                assert_eq!(*status, 429);
                assert_eq!(body, "quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.requests.lock().expect("should not be poisoned").len(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind ephemeral port");
        let addr = listener.local_addr().expect("should have local addr");
        drop(listener);

        let report = push_exporter(format!("http://{addr}/v3"))
            .export(&rows(1))
            .await
            .expect_err("export should fail");

        assert!(matches!(
            report.current_context(),
            ExportError::Request { url, .. } if url.ends_with("/projects/test-project/timeSeries")
        ));
    }
}
