use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{self, ApiState};
use crate::config::ServiceConfig;
use crate::execution::{
    ExecutionStore, InMemoryExecutionStore, InMemoryQueueStore, QueueManager, QueueStore,
};
use crate::orchestrator::{self, HttpOrchestratorClient, Orchestrator, OrchestratorClient};
use crate::shutdown::drain_queue;

/// One process serving both the orchestrator and the queue API.
pub struct Service {
    pub config: ServiceConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn ExecutionStore>,
    pub manager: QueueManager,
}

impl Service {
    /// Wire the default stack: in-memory stores and an HTTP client pointed at
    /// `config.queue.orchestrator_url`.
    pub fn new(config: ServiceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let client = HttpOrchestratorClient::new(&config.queue.orchestrator_url)?;
        Ok(Self::with_parts(
            config,
            Arc::new(InMemoryExecutionStore::new()),
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(client),
        ))
    }

    pub fn with_parts(
        config: ServiceConfig,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn QueueStore>,
        client: Arc<dyn OrchestratorClient>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::from_config(
            &config.runners,
            config.limits,
        ));
        let manager = QueueManager::new(
            queue,
            store.clone(),
            client,
            &config.queue,
            config.limits,
        );
        Self {
            config,
            orchestrator,
            store,
            manager,
        }
    }

    /// Orchestrator routes and queue API behind one router.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        orchestrator::server::router(self.orchestrator.clone())
            .merge(api::router(ApiState {
                store: self.store.clone(),
                manager: self.manager.clone(),
            }))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Fail every record a previous process left RUNNING.
    ///
    /// The default in-memory store starts empty, so this only finds work when
    /// a store that outlives the process is supplied through
    /// [`Self::with_parts`].
    pub async fn recover(&self) -> Vec<uuid::Uuid> {
        let interrupted = self.store.reconcile_stale().await;
        if !interrupted.is_empty() {
            tracing::warn!(count = interrupted.len(), "Marked interrupted executions as failed");
        }
        interrupted
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Startup runs [`Self::recover`]. On shutdown the queue is drained before
    /// the listener closes, because the consumer reaches the orchestrator
    /// through this same listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        self.recover().await;

        let app = self.router();
        let addr = self.config.listen_addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            addr = %addr,
            runners = ?self.orchestrator.runner_kinds(),
            "Artifact runner listening"
        );

        let manager = self.manager.clone();
        let grace = self.config.queue.drain_timeout();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                drain_queue(&manager, grace).await;
            })
            .await?;

        tracing::info!("Artifact runner stopped");
        Ok(())
    }
}
