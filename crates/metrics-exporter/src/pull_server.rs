//! Scrape endpoint for pull-based backends
//!
//! At most one listener runs per controller handle. Binding happens inside
//! the background task, so a port conflict never fails the caller; it is only
//! logged as [`PullServerError::ListenerBindFailed`].

use core::error::Error;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use poem::handler;
use poem::listener::TcpAcceptor;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";
pub const SCRAPE_PATH: &str = "/metrics";
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pull server errors. They are raised inside the background task and only logged.
#[derive(Debug, derive_more::Display)]
pub enum PullServerError {
    #[display("Failed to bind pull listener on {addr}: {message}")]
    ListenerBindFailed { addr: String, message: String },
    #[display("Pull server on {addr} failed: {message}")]
    ServerFailed { addr: String, message: String },
}

impl Error for PullServerError {}

/// Source of the scrape response body.
pub trait ScrapeHandler: Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn scrape(&self) -> String;
}

#[handler]
fn scrape(Data(handler): Data<&Arc<dyn ScrapeHandler>>) -> Response {
    Response::builder()
        .content_type(handler.content_type())
        .body(handler.scrape())
}

/// Description of a running pull server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullServerInfo {
    pub listen_addr: String,
    pub path: &'static str,
}

/// Handle to a background scrape listener.
///
/// Dropping the handle closes the listener without waiting for it.
pub struct PullServerHandle {
    listen_addr: String,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PullServerHandle {
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn info(&self) -> PullServerInfo {
        PullServerInfo {
            listen_addr: self.listen_addr.clone(),
            path: SCRAPE_PATH,
        }
    }

    /// Signals the listener to stop accepting connections. Idempotent.
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Closes the listener and waits for the background task to finish
    /// draining. Idempotent.
    pub async fn shutdown(&mut self) {
        self.close();
        let Some(task) = self.task.take() else {
            debug!(listen_addr = %self.listen_addr, "Pull server already shut down");
            return;
        };
        if let Err(e) = task.await {
            error!(listen_addr = %self.listen_addr, "Pull server task failed: {e}");
        }
    }
}

impl Drop for PullServerHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Starts and stops the scrape listener.
#[derive(Debug, Clone)]
pub struct PullServerController {
    listen_addr: String,
    drain_timeout: Duration,
}

impl Default for PullServerController {
    fn default() -> Self {
        Self::new(DEFAULT_LISTEN_ADDR)
    }
}

impl PullServerController {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Spawns a listener serving `handler` on the scrape path.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, handler: Arc<dyn ScrapeHandler>) -> PullServerHandle {
        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(serve(
            self.listen_addr.clone(),
            handler,
            cancellation_token.clone(),
            self.drain_timeout,
        ));
        PullServerHandle {
            listen_addr: self.listen_addr.clone(),
            cancellation_token,
            task: Some(task),
        }
    }

    /// Shuts down `old`, if any, then starts a fresh listener.
    pub async fn replace(
        &self,
        old: Option<PullServerHandle>,
        handler: Arc<dyn ScrapeHandler>,
    ) -> PullServerHandle {
        self.stop(old).await;
        self.start(handler)
    }

    /// Shuts down `handle`. Absent handles are a no-op.
    pub async fn stop(&self, handle: Option<PullServerHandle>) {
        if let Some(mut handle) = handle {
            handle.shutdown().await;
        }
    }
}

fn scrape_app(handler: Arc<dyn ScrapeHandler>) -> impl Endpoint {
    Route::new()
        .at(SCRAPE_PATH, poem::get(scrape))
        .data(handler)
        .with(Tracing)
}

async fn serve(
    listen_addr: String,
    handler: Arc<dyn ScrapeHandler>,
    cancellation_token: CancellationToken,
    drain_timeout: Duration,
) {
    let bind = tokio::select! {
        _ = cancellation_token.cancelled() => {
            debug!(%listen_addr, "Pull server closed before binding");
            return;
        }
        bind = tokio::net::TcpListener::bind(&listen_addr) => bind,
    };
    let acceptor = match bind.and_then(TcpAcceptor::from_tokio) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            let report = Report::new(PullServerError::ListenerBindFailed {
                addr: listen_addr.clone(),
                message: e.to_string(),
            });
            error!("Scrape endpoint unavailable, metrics keep aggregating: {report:?}");
            return;
        }
    };

    info!(%listen_addr, path = SCRAPE_PATH, "Starting pull server");
    let app = scrape_app(handler);
    let signal = {
        let token = cancellation_token.clone();
        async move { token.cancelled().await }
    };

    match Server::new_with_acceptor(acceptor)
        .run_with_graceful_shutdown(app, signal, Some(drain_timeout))
        .await
    {
        Ok(()) => info!(%listen_addr, "Pull server stopped"),
        Err(e) => {
            let report = Report::new(PullServerError::ServerFailed {
                addr: listen_addr,
                message: e.to_string(),
            });
            error!("{report:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener as StdTcpListener;

    use poem::http::StatusCode;
    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    struct StaticHandler(&'static str);

    impl ScrapeHandler for StaticHandler {
        fn content_type(&self) -> &'static str {
            "text/plain"
        }

        fn scrape(&self) -> String {
            self.0.to_string()
        }
    }

    fn free_addr() -> String {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("should bind ephemeral port");
        let addr = listener.local_addr().expect("should have local addr");
        addr.to_string()
    }

    async fn get_body(addr: &str) -> Option<String> {
        for _ in 0..50 {
            if let Ok(response) = reqwest::get(format!("http://{addr}{SCRAPE_PATH}")).await {
                return response.text().await.ok();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    #[test(tokio::test)]
    async fn scrape_route_sets_content_type() {
        let client = TestClient::new(scrape_app(Arc::new(StaticHandler("up 1\n"))));

        let response = client.get(SCRAPE_PATH).send().await;
        response.assert_status_is_ok();
        response.assert_content_type("text/plain");
        response.assert_text("up 1\n").await;

        let response = client.get("/other").send().await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[test(tokio::test)]
    async fn serves_handler_on_scrape_path() {
        let addr = free_addr();
        let controller = PullServerController::new(addr.clone());

        let mut handle = controller.start(Arc::new(StaticHandler("up 1\n")));

        assert_eq!(get_body(&addr).await.as_deref(), Some("up 1\n"));
        assert_eq!(
            handle.info(),
            PullServerInfo {
                listen_addr: addr.clone(),
                path: "/metrics",
            }
        );
        handle.shutdown().await;
        assert!(reqwest::get(format!("http://{addr}{SCRAPE_PATH}")).await.is_err());
    }

    #[test(tokio::test)]
    async fn close_and_shutdown_are_idempotent() {
        let controller = PullServerController::new(free_addr());
        let mut handle = controller.start(Arc::new(StaticHandler("")));

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        handle.shutdown().await;
        handle.shutdown().await;

        controller.stop(None).await;
    }

    #[test(tokio::test)]
    async fn replace_rebinds_the_same_port() {
        let addr = free_addr();
        let controller = PullServerController::new(addr.clone());

        let first = controller.start(Arc::new(StaticHandler("first")));
        assert_eq!(get_body(&addr).await.as_deref(), Some("first"));

        let mut second = controller
            .replace(Some(first), Arc::new(StaticHandler("second")))
            .await;
        assert_eq!(get_body(&addr).await.as_deref(), Some("second"));
        second.shutdown().await;
    }

    #[test(tokio::test)]
    async fn bind_failure_does_not_panic() {
        let occupied = StdTcpListener::bind("127.0.0.1:0").expect("should bind ephemeral port");
        let addr = occupied.local_addr().expect("should have local addr").to_string();
        let controller = PullServerController::new(addr);

        let mut handle = controller.start(Arc::new(StaticHandler("")));

        // the task ends on its own once the bind fails
        handle.shutdown().await;
        assert!(handle.is_closed());
    }
}
