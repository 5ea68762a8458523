use bollard::Docker;
use faas_common::{FaasError, Orchestrator};
use faas_orchestrator::{DockerBackend, DockerConfig};
use mockito::{Matcher, ServerGuard};
use std::sync::Arc;

fn container_path(name: &str) -> Matcher {
    Matcher::Regex(format!(r"^(/v[\d.]+)?/containers/{name}(\?.*)?$"))
}

fn backend(server: &ServerGuard) -> DockerBackend {
    let docker =
        Docker::connect_with_http(&server.url(), 5, bollard::API_DEFAULT_VERSION).unwrap();
    DockerBackend::new(Arc::new(docker), DockerConfig::default())
}

#[tokio::test]
async fn test_teardown_treats_missing_container_as_removed() {
    let mut server = mockito::Server::new_async().await;
    let removed = server
        .mock("DELETE", container_path("faas-worker-d1"))
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("force".into(), "true".into()),
            Matcher::UrlEncoded("v".into(), "true".into()),
        ]))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let missing = server
        .mock("DELETE", container_path("faas-worker-d2"))
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"No such container: faas-worker-d2"}"#)
        .expect(2)
        .create_async()
        .await;

    let backend = backend(&server);
    backend.teardown("faas-worker-d1").await.unwrap();
    backend.teardown("faas-worker-d2").await.unwrap();
    backend.teardown("faas-worker-d2").await.unwrap();

    removed.assert_async().await;
    missing.assert_async().await;
}

#[tokio::test]
async fn test_teardown_surfaces_daemon_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("DELETE", container_path("faas-worker-d3"))
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"driver failed"}"#)
        .create_async()
        .await;

    let err = backend(&server).teardown("faas-worker-d3").await.unwrap_err();
    assert!(matches!(err, FaasError::Teardown(_)), "got {err:?}");
}

#[tokio::test]
async fn test_teardown_with_empty_handle_calls_nothing() {
    let mut server = mockito::Server::new_async().await;
    let any = server
        .mock("DELETE", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    backend(&server).teardown("").await.unwrap();
    any.assert_async().await;
}

#[tokio::test]
async fn test_teardown_function_removes_named_container() {
    let mut server = mockito::Server::new_async().await;
    let removed = server
        .mock("DELETE", container_path("faas-worker-d4"))
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"No such container"}"#)
        .expect(1)
        .create_async()
        .await;

    backend(&server).teardown_function("d4").await.unwrap();
    removed.assert_async().await;
}
