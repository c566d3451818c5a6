//! Follows the observability config file
//!
//! The file is usually a mounted ConfigMap, which is swapped through a
//! symlink in its directory, so the whole parent directory is watched and the
//! file is re-read on every change.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use api_types::Tag;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::exporter_config_from_map;
use crate::config::load_config_map;
use crate::config::ConfigError;
use crate::config::ConfigSourceArgs;
use crate::registry::ExporterRegistry;
use crate::view::Aggregation;
use crate::view::View;
use crate::view::ViewRegistry;

pub const RECONFIGURATIONS_VIEW: &str = "exporter_reconfigurations";

/// Reconfigures the exporter registry whenever the config file changes.
pub struct ConfigWatcher {
    config_path: PathBuf,
    domain: String,
    component: String,
    registry: Arc<ExporterRegistry>,
    views: Arc<ViewRegistry>,
    reconfigurations: Arc<View>,
}

impl ConfigWatcher {
    pub fn new(
        source: &ConfigSourceArgs,
        registry: Arc<ExporterRegistry>,
        views: Arc<ViewRegistry>,
    ) -> Self {
        Self {
            config_path: source.config.clone(),
            domain: source.domain.clone(),
            component: source.component.clone(),
            registry,
            views,
            reconfigurations: Arc::new(View::new(
                RECONFIGURATIONS_VIEW,
                "Number of exporter reconfigurations by outcome",
                Aggregation::Sum,
            )),
        }
    }

    /// Reads the config file and reconfigures the registry when the resulting
    /// config differs from the active one.
    ///
    /// Returns whether a reconfiguration succeeded. Reconfiguration failures
    /// are logged and counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed into a
    /// config.
    pub async fn apply(&self) -> Result<bool, Report<ConfigError>> {
        let data = load_config_map(&self.config_path)?;
        let config = exporter_config_from_map(&data, &self.domain, &self.component)?;

        if self.registry.current_exporter().await.is_some()
            && self.registry.current_config().await.as_ref() == Some(&config)
        {
            debug!(%config, "Metrics config unchanged");
            return Ok(false);
        }

        let succeeded = match self.registry.reconfigure(config).await {
            Ok(_) => true,
            Err(report) => {
                error!("Failed to reconfigure the metrics exporter: {report:?}");
                false
            }
        };
        let outcome = if succeeded { "success" } else { "failure" };
        self.views
            .record(&self.reconfigurations, vec![Tag::new("outcome", outcome)], 1.0);
        Ok(succeeded)
    }

    /// Applies the current file, then re-applies it on every change until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if the file system watch cannot be set up.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), Report<ConfigError>> {
        let watch_error = || ConfigError::Watch {
            path: self.config_path.display().to_string(),
        };

        // a full channel only drops notifications, the next apply reads the whole file anyway
        let (sender, mut receiver) = mpsc::channel::<notify::Result<Event>>(16);
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = sender.try_send(event);
            },
            notify::Config::default(),
        )
        .change_context_lazy(watch_error)?;

        let dir = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_error)?;
        info!(config = %self.config_path.display(), "Watching metrics config");

        self.apply_logged().await;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Config watcher shutdown requested");
                    break;
                }
                event = receiver.recv() => match event {
                    Some(Ok(event)) if !matches!(event.kind, EventKind::Access(_)) => {
                        debug!(?event, "Config directory changed");
                        self.apply_logged().await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("Config watch error: {e}"),
                    None => {
                        warn!("Config watch channel closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn apply_logged(&self) {
        if let Err(report) = self.apply().await {
            error!("Failed to load the metrics config: {report:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use api_types::BackendKind;
    use api_types::PlatformMetadata;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::backends::CloudMonitoringBuilder;
    use crate::factory::BackendExporterFactory;
    use crate::pull_server::PullServerController;
    use crate::resource::ResourceResolver;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        registry: Arc<ExporterRegistry>,
        views: Arc<ViewRegistry>,
        watcher: ConfigWatcher,
    }

    fn fixture(contents: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, contents).expect("should write config");

        let views = Arc::new(ViewRegistry::new());
        let factory = BackendExporterFactory::new(
            ResourceResolver::new(Arc::new(PlatformMetadata::default())),
            Arc::new(CloudMonitoringBuilder::default()),
            PullServerController::new("127.0.0.1:0"),
        );
        let registry = Arc::new(ExporterRegistry::new(views.clone(), factory));
        let source = ConfigSourceArgs {
            config: path.clone(),
            domain: "knative.dev/serving".to_string(),
            component: "autoscaler".to_string(),
        };
        let watcher = ConfigWatcher::new(&source, registry.clone(), views.clone());
        Fixture {
            _dir: dir,
            path,
            registry,
            views,
            watcher,
        }
    }

    fn reconfigurations(views: &ViewRegistry, outcome: &str) -> f64 {
        views
            .snapshot()
            .into_iter()
            .filter(|data| data.view.name == RECONFIGURATIONS_VIEW)
            .flat_map(|data| data.rows)
            .filter(|row| row.tags == vec![Tag::new("outcome", outcome)])
            .map(|row| row.value)
            .sum()
    }

    #[test(tokio::test)]
    async fn apply_skips_unchanged_config() {
        let f = fixture("metrics.backend-destination: prometheus\n");

        assert!(f.watcher.apply().await.expect("apply should succeed"));
        assert!(!f.watcher.apply().await.expect("apply should succeed"));

        let config = f.registry.current_config().await.expect("config should be set");
        assert_eq!(config.backend, BackendKind::LocalPull);
        assert_eq!(reconfigurations(&f.views, "success"), 1.0);
        f.registry.shutdown().await;
    }

    #[test(tokio::test)]
    async fn apply_counts_failed_reconfigurations() {
        let f = fixture(
            "metrics.backend-destination: stackdriver\n\
             metrics.stackdriver-project-id: BAD\n",
        );

        assert!(!f.watcher.apply().await.expect("config should parse"));

        assert!(f.registry.current_exporter().await.is_none());
        assert_eq!(reconfigurations(&f.views, "failure"), 1.0);
    }

    #[test(tokio::test)]
    async fn apply_rejects_unknown_backend() {
        let f = fixture("metrics.backend-destination: opencensus\n");

        let report = f.watcher.apply().await.expect_err("apply should fail");

        assert!(matches!(
            report.current_context(),
            ConfigError::UnsupportedBackend { .. }
        ));
        assert!(f.registry.current_config().await.is_none());
    }

    #[test(tokio::test)]
    async fn run_follows_file_changes() {
        let f = fixture("metrics.backend-destination: prometheus\n");
        let token = CancellationToken::new();
        let watcher = Arc::new(f.watcher);
        let task = {
            let watcher = watcher.clone();
            let token = token.clone();
            tokio::spawn(async move { watcher.run(token).await })
        };

        let mut backend = None;
        for _ in 0..100 {
            backend = f.registry.current_config().await.map(|config| config.backend);
            if backend == Some(BackendKind::LocalPull) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend, Some(BackendKind::LocalPull));

        fs::write(
            &f.path,
            "metrics.backend-destination: stackdriver\n\
             metrics.stackdriver-project-id: test-project\n",
        )
        .expect("should rewrite config");

        for _ in 0..250 {
            backend = f.registry.current_config().await.map(|config| config.backend);
            if backend == Some(BackendKind::CloudPush) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend, Some(BackendKind::CloudPush));
        assert!(f.registry.current_pull_server().await.is_none());

        token.cancel();
        task.await
            .expect("watcher task should not panic")
            .expect("watcher should stop cleanly");
        f.registry.shutdown().await;
    }
}
