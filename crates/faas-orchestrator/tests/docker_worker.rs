use faas_common::{CodeStorage, LocalCodeStorage, Orchestrator};
use faas_orchestrator::{Backend, BackendType, DockerBackend, DockerConfig};

// Needs a Docker daemon and a worker image (WORKER_IMAGE, default faas-worker:latest).
#[tokio::test]
#[ignore = "requires a running Docker daemon and worker image"]
async fn test_provision_and_teardown_worker() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = LocalCodeStorage::new(dir.path());
    let function_id = "itest0docker";
    let location = storage
        .store(function_id, b"def echo(payload):\n    return payload\n")
        .await?;

    let mut config = DockerConfig::default();
    if let Ok(image) = std::env::var("WORKER_IMAGE") {
        config.worker_image = image;
    }
    let backend = Backend::Docker(DockerBackend::connect(config)?);
    assert_eq!(backend.backend_type(), BackendType::Docker);

    let provisioned = backend
        .provision(function_id, &location, "function.handler.echo")
        .await?;
    assert!(provisioned.endpoint.starts_with("localhost:"));

    // Provisioning the same id again replaces the stale container.
    let again = backend
        .provision(function_id, &location, "function.handler.echo")
        .await?;

    backend.teardown(&again.backend_handle).await?;
    backend.teardown(&again.backend_handle).await?;
    backend.teardown(&provisioned.backend_handle).await?;
    storage.delete(&location).await?;
    Ok(())
}
