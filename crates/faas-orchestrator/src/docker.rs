//! Docker backend: one long-running worker container per function.

use crate::{is_docker_not_found, worker_name, OrchestratorError};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use faas_common::{
    Orchestrator, Provisioned, Result as CommonResult, CODE_MOUNT_PATH, HANDLER_ENV_VAR,
    WORKER_PORT,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Credentials for pulling the worker image from a private registry.
#[derive(Clone)]
pub struct RegistryAuth {
    pub server_address: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub worker_image: String,
    /// Host name put in front of the published port to form the endpoint
    pub worker_host: String,
    pub registry_auth: Option<RegistryAuth>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            worker_image: "faas-worker:latest".to_string(),
            worker_host: "localhost".to_string(),
            registry_auth: None,
        }
    }
}

#[derive(Clone)]
pub struct DockerBackend {
    docker: Arc<Docker>,
    config: DockerConfig,
    credentials: Option<DockerCredentials>,
}

impl std::fmt::Debug for DockerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl DockerBackend {
    pub fn new(docker: Arc<Docker>, config: DockerConfig) -> Self {
        let credentials = config.registry_auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.server_address.clone()),
            ..Default::default()
        });
        if let Some(auth) = &config.registry_auth {
            info!(registry = %auth.server_address, "Configured registry authentication");
        }

        Self {
            docker,
            config,
            credentials,
        }
    }

    /// Connect to the local daemon using the usual `DOCKER_HOST` / socket defaults.
    pub fn connect(config: DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker), config))
    }

    /// Pull the worker image only when it is not already present locally.
    #[instrument(skip(self), fields(image = %self.config.worker_image))]
    async fn ensure_image(&self) -> Result<()> {
        match self.docker.inspect_image(&self.config.worker_image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_docker_not_found(&e) => {}
            Err(e) => return Err(OrchestratorError::ImageInspect(e)),
        }

        info!("Pulling worker image from registry");
        let (from_image, tag) = split_image_ref(&self.config.worker_image);
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            self.credentials.clone(),
        );
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(OrchestratorError::ImagePull)?;
            if let Some(status) = progress.status {
                debug!(%status, "pull progress");
            }
        }
        Ok(())
    }

    /// Force-remove a container, treating "no such container" as success.
    async fn remove_container(&self, name_or_id: &str) -> Result<()> {
        let opts = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(name_or_id, opts).await {
            Ok(()) => Ok(()),
            Err(e) if is_docker_not_found(&e) => Ok(()),
            Err(e) => Err(OrchestratorError::RemovalFailed(e)),
        }
    }

    #[instrument(skip(self, code_location, handler))]
    async fn run_worker(
        &self,
        function_id: &str,
        code_location: &str,
        handler: &str,
    ) -> Result<Provisioned> {
        let name = worker_name(function_id);

        self.ensure_image().await?;

        // A container left behind by a previous process or failed attempt would
        // block the name.
        if let Err(e) = self.remove_container(&name).await {
            warn!(container = %name, error = %e, "Failed to remove stale container");
        }

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                worker_container_config(&self.config.worker_image, code_location, handler),
            )
            .await
            .map_err(OrchestratorError::CreationFailed)?;
        let container_id = created.id;

        match self.start_and_resolve_port(&container_id).await {
            Ok(host_port) => {
                let endpoint = format!("{}:{}", self.config.worker_host, host_port);
                info!(%container_id, %function_id, %host_port, "Worker container started");
                Ok(Provisioned {
                    backend_handle: container_id,
                    endpoint,
                })
            }
            Err(e) => {
                // Don't leave a half-started container holding the name.
                if let Err(cleanup) = self.remove_container(&container_id).await {
                    warn!(%container_id, error = %cleanup, "Failed to remove container after failed start");
                }
                Err(e)
            }
        }
    }

    async fn start_and_resolve_port(&self, container_id: &str) -> Result<u16> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(OrchestratorError::StartFailed)?;

        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(OrchestratorError::InspectFailed)?;

        published_host_port(&inspect)
            .ok_or_else(|| OrchestratorError::MissingHostPort(container_id.to_string()))
    }
}

#[async_trait]
impl Orchestrator for DockerBackend {
    async fn provision(
        &self,
        function_id: &str,
        code_location: &str,
        handler: &str,
    ) -> CommonResult<Provisioned> {
        self.run_worker(function_id, code_location, handler)
            .await
            .map_err(OrchestratorError::into_provision)
    }

    #[instrument(skip(self))]
    async fn teardown(&self, backend_handle: &str) -> CommonResult<()> {
        if backend_handle.is_empty() {
            return Ok(());
        }
        info!(container_id = %backend_handle, "Stopping and removing container");
        self.remove_container(backend_handle)
            .await
            .map_err(OrchestratorError::into_teardown)
    }

    #[instrument(skip(self))]
    async fn teardown_function(&self, function_id: &str) -> CommonResult<()> {
        self.remove_container(&worker_name(function_id))
            .await
            .map_err(OrchestratorError::into_teardown)
    }
}

fn worker_port_key() -> String {
    format!("{WORKER_PORT}/tcp")
}

/// Container definition for a worker: code mounted read-only, handler in the
/// environment, worker port published on a random host port.
pub(crate) fn worker_container_config(
    image: &str,
    code_location: &str,
    handler: &str,
) -> ContainerConfig<String> {
    let port_key = worker_port_key();

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: None,
        }]),
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    ContainerConfig {
        image: Some(image.to_string()),
        env: Some(vec![format!("{HANDLER_ENV_VAR}={handler}")]),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{code_location}:{CODE_MOUNT_PATH}:ro")]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host port Docker assigned to the worker port, if any.
pub(crate) fn published_host_port(inspect: &ContainerInspectResponse) -> Option<u16> {
    inspect
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&worker_port_key())?
        .as_ref()?
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse::<u16>().ok().filter(|p| *p != 0))
}

/// Split an image reference into the `fromImage`/`tag` pair the pull API wants.
/// Without an explicit tag the daemon would pull every tag, so default to `latest`.
pub(crate) fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        // Digest references are pulled as-is.
        return (image.to_string(), String::new());
    }
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(pos) => {
            let split = last_segment_start + pos;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
