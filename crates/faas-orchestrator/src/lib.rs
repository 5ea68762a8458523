use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use faas_common::{FaasError, Orchestrator, Provisioned, Result};
use thiserror::Error;

pub use faas_common as common;

pub mod docker;
pub mod kubernetes;

pub use docker::{DockerBackend, DockerConfig, RegistryAuth};
pub use kubernetes::{AutoscalingPolicy, KubernetesBackend, KubernetesConfig, ResourceNames};

/// Name prefix shared by worker containers and deployments.
pub const WORKER_NAME_PREFIX: &str = "faas-worker-";

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Image inspect failed: {0}")]
    ImageInspect(#[source] BollardError),
    #[error("Image pull failed: {0}")]
    ImagePull(#[source] BollardError),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container inspect failed: {0}")]
    InspectFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("No host port published for worker {0}")]
    MissingHostPort(String),
    #[error("Kubernetes {action} {resource} failed: {source}")]
    Kube {
        action: &'static str,
        resource: String,
        #[source]
        source: kube::Error,
    },
    #[error("Kubernetes client error: {0}")]
    KubeClient(#[from] kube::Error),
    #[error("Service {0} has no node port assigned")]
    MissingNodePort(String),
    #[error("Invalid backend handle: '{0}'")]
    InvalidHandle(String),
    #[error("Handler code unavailable: {0}")]
    Code(#[source] FaasError),
}

impl OrchestratorError {
    pub fn into_provision(self) -> FaasError {
        FaasError::Provision(self.to_string())
    }

    pub fn into_teardown(self) -> FaasError {
        FaasError::Teardown(self.to_string())
    }
}

pub(crate) fn is_docker_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Worker container / deployment name for a function.
pub fn worker_name(function_id: &str) -> String {
    format!("{WORKER_NAME_PREFIX}{function_id}")
}

/// Backend selection, read once from configuration at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Single host Docker daemon
    #[default]
    Docker,
    /// Kubernetes cluster (in-cluster or kubeconfig credentials)
    Kubernetes,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            _ => Err(format!("Invalid backend type: {}", s)),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Docker => f.write_str("docker"),
            BackendType::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

/// The closed set of provisioning backends.
pub enum Backend {
    Docker(DockerBackend),
    Kubernetes(KubernetesBackend),
}

impl Backend {
    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Docker(_) => BackendType::Docker,
            Backend::Kubernetes(_) => BackendType::Kubernetes,
        }
    }
}

#[async_trait]
impl Orchestrator for Backend {
    async fn provision(
        &self,
        function_id: &str,
        code_location: &str,
        handler: &str,
    ) -> Result<Provisioned> {
        match self {
            Backend::Docker(docker) => docker.provision(function_id, code_location, handler).await,
            Backend::Kubernetes(kube) => kube.provision(function_id, code_location, handler).await,
        }
    }

    async fn teardown(&self, backend_handle: &str) -> Result<()> {
        match self {
            Backend::Docker(docker) => docker.teardown(backend_handle).await,
            Backend::Kubernetes(kube) => kube.teardown(backend_handle).await,
        }
    }

    async fn teardown_function(&self, function_id: &str) -> Result<()> {
        match self {
            Backend::Docker(docker) => docker.teardown_function(function_id).await,
            Backend::Kubernetes(kube) => kube.teardown_function(function_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_parsing() {
        assert_eq!("docker".parse::<BackendType>().unwrap(), BackendType::Docker);
        assert_eq!(
            "Kubernetes".parse::<BackendType>().unwrap(),
            BackendType::Kubernetes
        );
        assert_eq!("k8s".parse::<BackendType>().unwrap(), BackendType::Kubernetes);
        assert!("nomad".parse::<BackendType>().is_err());
        assert_eq!(BackendType::default(), BackendType::Docker);
        assert_eq!(BackendType::Kubernetes.to_string(), "kubernetes");
    }

    #[test]
    fn test_worker_name() {
        assert_eq!(worker_name("abc123"), "faas-worker-abc123");
    }

    #[test]
    fn test_not_found_detection() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "removal already in progress".to_string(),
        };
        assert!(is_docker_not_found(&not_found));
        assert!(!is_docker_not_found(&conflict));
    }

    #[test]
    fn test_error_conversion_keeps_message() {
        let err = OrchestratorError::MissingHostPort("faas-worker-x".to_string());
        match err.into_provision() {
            FaasError::Provision(msg) => assert!(msg.contains("faas-worker-x")),
            other => panic!("unexpected error: {other:?}"),
        }
        let err = OrchestratorError::InvalidHandle("bogus".to_string());
        assert!(matches!(err.into_teardown(), FaasError::Teardown(_)));
    }
}
