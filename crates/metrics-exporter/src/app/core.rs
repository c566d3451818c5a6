use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
}

impl Application {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self {
            services: ApplicationServices::from_daemon_args(&daemon_args),
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    /// Starts all tasks and waits for a shutdown signal or an unexpected task exit
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Stops the active exporter and pushes one last report
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        let failures = self.services.views.flush().await;
        if failures > 0 {
            tracing::warn!(failures, "Final metrics flush had failures");
        }
        self.services.registry.shutdown().await;

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
