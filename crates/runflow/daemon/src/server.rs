//! Service wiring and lifecycle management

use crate::error::DaemonResult;
use crate::seed;
use runflow_bus::EventBus;
use runflow_engine::{triggers, OrchestrationEngine, RunflowConfig};
use runflow_queue::{JobQueue, WorkerPool};
use runflow_rules::{InMemoryRuleStore, RuleEngine};
use runflow_script::Sandbox;
use std::sync::Arc;
use std::time::Duration;

/// Grace period for in-flight event handlers at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runflow daemon server
pub struct Server {
    bus: EventBus,
    queue: Arc<JobQueue>,
    engine: OrchestrationEngine,
}

impl Server {
    /// Build every service and load seed files
    pub async fn new(config: RunflowConfig) -> DaemonResult<Self> {
        let bus = EventBus::new();
        let sandbox = Sandbox::new(config.sandbox.clone());

        let queue = Arc::new(
            JobQueue::connect(config.queue.clone(), config.engine.deployment_id.clone()).await,
        );
        if !queue.is_enabled() {
            tracing::warn!("Durable queue disabled; waits and timeouts will not survive a restart");
        }

        let rules = RuleEngine::new(Arc::new(InMemoryRuleStore::new()), sandbox.clone(), bus.clone());
        let engine = OrchestrationEngine::new(config.engine.clone(), bus.clone(), queue.clone(), sandbox);

        if let Some(dir) = config.daemon.definitions_dir.as_deref() {
            let count = seed::load_definitions(dir, engine.registry())?;
            tracing::info!(count, dir = %dir.display(), "Definitions loaded");
        }
        if let Some(dir) = config.daemon.rules_dir.as_deref() {
            let count = seed::load_rules(dir, &rules).await?;
            tracing::info!(count, dir = %dir.display(), "Rules loaded");
        }

        rules.listen()?;
        triggers::install(&engine)?;

        Ok(Self { bus, queue, engine })
    }

    /// Run workers until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let workers = WorkerPool::new(self.queue.clone(), Arc::new(self.engine.clone())).start();
        tracing::info!(
            deployment_id = self.queue.deployment_id(),
            definitions = self.engine.registry().count(),
            "Runflow daemon ready"
        );

        shutdown_signal().await;

        tracing::info!("Runflow daemon shutting down");
        self.queue.pause();
        workers.stop().await;
        if !self.bus.shutdown(SHUTDOWN_GRACE).await {
            tracing::warn!("Event handlers still running after grace period");
        }
        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
