use color_eyre::eyre;
use faas_common::{CodeStorage, LocalCodeStorage};
use faas_orchestrator::{Backend, BackendType, DockerBackend, KubernetesBackend};
use faas_service_lib::{
    api_routes, FunctionManager, JsonFileFunctionStore, ServiceConfig, WorkerClient,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    info!(
        backend = %config.backend_type,
        listen_addr = %config.listen_addr,
        image = %config.worker_image,
        "Starting FaaS service"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let code_storage: Arc<dyn CodeStorage> = Arc::new(LocalCodeStorage::new(&config.storage_dir));

    let backend = match config.backend_type {
        BackendType::Docker => Backend::Docker(DockerBackend::connect(config.docker_config())?),
        BackendType::Kubernetes => Backend::Kubernetes(
            KubernetesBackend::connect(config.kubernetes_config(), code_storage.clone()).await?,
        ),
    };

    let store = Arc::new(JsonFileFunctionStore::open(&config.db_path).await?);
    let mut worker = WorkerClient::new();
    if let Some(timeout) = config.execution_timeout {
        worker = worker.with_timeout(timeout);
    }
    let manager = Arc::new(
        FunctionManager::new(store, code_storage, Arc::new(backend))
            .with_worker_client(worker)
            .with_provision_timeout(config.provision_timeout),
    );

    // Workers from a previous run are gone or stale; bring them back first.
    let report = manager.restart_running_functions().await?;
    for (function_id, outcome) in &report.outcomes {
        info!(%function_id, ?outcome, "Restart outcome");
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "API server listening");
    axum::serve(listener, api_routes::router(manager.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, tearing down workers");
    match manager.cleanup_all_functions().await {
        Ok(report) if report.failed() > 0 => {
            warn!(failed = report.failed(), "Some workers could not be torn down")
        }
        Ok(report) => info!(torn_down = report.torn_down(), "Cleanup complete"),
        Err(e) => error!(error = %e, "Cleanup failed"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
