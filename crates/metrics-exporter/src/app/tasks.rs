use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let reporter_task = self.spawn_reporter_task(app);
        self.tasks.push(reporter_task);

        let config_watcher_task = self.spawn_config_watcher_task(app);
        self.tasks.push(config_watcher_task);
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        self.wait_until(signal_handler).await
    }

    /// Waits for `shutdown` to resolve, then cancels every task and waits for
    /// them to stop. A task exiting on its own first is reported as an error.
    pub async fn wait_until(&mut self, shutdown: JoinHandle<()>) -> Result<()> {
        if self.tasks.is_empty() {
            shutdown.await?;
            return Ok(());
        }

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
                anyhow::bail!("background task exited before shutdown was requested");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_reporter_task(&self, app: &Application) -> JoinHandle<()> {
        let views = app.services().views.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting metrics reporter task");
            views.run_reporter(token).await;
            tracing::info!("Metrics reporter task completed");
        })
    }

    fn spawn_config_watcher_task(&self, app: &Application) -> JoinHandle<()> {
        let config_watcher = app.services().config_watcher.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting config watcher task");
            if let Err(e) = config_watcher.run(token.clone()).await {
                tracing::error!("Config watcher failed: {e:?}");
                // keep the task alive so a broken watch does not tear down the reporter
                token.cancelled().await;
            } else {
                tracing::info!("Config watcher task completed");
            }
        })
    }
}
