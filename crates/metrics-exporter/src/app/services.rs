use std::sync::Arc;

use crate::backends::CloudMonitoringBuilder;
use crate::config::DaemonArgs;
use crate::factory::BackendExporterFactory;
use crate::pull_server::PullServerController;
use crate::registry::ExporterRegistry;
use crate::resource::EnvMetadataProvider;
use crate::resource::ResourceResolver;
use crate::view::ViewRegistry;
use crate::watcher::ConfigWatcher;

/// Long-lived services shared by the background tasks
#[derive(Clone)]
pub struct ApplicationServices {
    pub views: Arc<ViewRegistry>,
    pub registry: Arc<ExporterRegistry>,
    pub config_watcher: Arc<ConfigWatcher>,
}

impl ApplicationServices {
    pub fn from_daemon_args(daemon_args: &DaemonArgs) -> Self {
        let views = Arc::new(ViewRegistry::new());

        let push_builder = CloudMonitoringBuilder::new(daemon_args.cloud_monitoring_endpoint.clone())
            .with_access_token(daemon_args.access_token.clone());
        let factory = BackendExporterFactory::new(
            ResourceResolver::new(Arc::new(EnvMetadataProvider)),
            Arc::new(push_builder),
            PullServerController::new(daemon_args.listen_addr.clone()),
        );
        let registry = Arc::new(ExporterRegistry::new(views.clone(), factory));

        let config_watcher = Arc::new(ConfigWatcher::new(
            &daemon_args.source,
            registry.clone(),
            views.clone(),
        ));

        Self {
            views,
            registry,
            config_watcher,
        }
    }
}
