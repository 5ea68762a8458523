//! Service configuration, read from the environment once at startup.

use faas_common::{FaasError, Result};
use faas_orchestrator::{
    AutoscalingPolicy, BackendType, DockerConfig, KubernetesConfig, RegistryAuth,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WORKER_IMAGE: &str = "faas-worker:latest";
const DEFAULT_STORAGE_DIR: &str = "/tmp/faas_functions";
const DEFAULT_NAMESPACE: &str = "faas-workers";
const STORE_FILE_NAME: &str = "functions.json";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub backend_type: BackendType,
    pub worker_image: String,
    pub registry_auth: Option<RegistryAuth>,
    pub storage_dir: PathBuf,
    pub db_path: PathBuf,
    pub worker_host: String,
    pub namespace: String,
    pub node_host: String,
    pub service_account: Option<String>,
    pub image_pull_secret: Option<String>,
    pub autoscaling_enabled: bool,
    pub provision_timeout: Option<Duration>,
    pub execution_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let storage_dir = PathBuf::from(DEFAULT_STORAGE_DIR);
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend_type: BackendType::Docker,
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            registry_auth: None,
            db_path: storage_dir.join(STORE_FILE_NAME),
            storage_dir,
            worker_host: "localhost".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            node_host: "localhost".to_string(),
            service_account: None,
            image_pull_secret: None,
            autoscaling_enabled: false,
            provision_timeout: None,
            execution_timeout: None,
        }
    }
}

impl ServiceConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let listen_addr = var("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| FaasError::Config(format!("LISTEN_ADDR: {e}")))?;

        let backend_type = match var("DEPLOYMENT_ENV") {
            Some(value) => value.parse::<BackendType>().map_err(FaasError::Config)?,
            None => BackendType::default(),
        };

        let registry_auth = match (var("REGISTRY_USER"), var("REGISTRY_PASS")) {
            (Some(username), Some(password)) => Some(RegistryAuth {
                server_address: var("REGISTRY_URL").unwrap_or_default(),
                username,
                password,
            }),
            _ => None,
        };

        let storage_dir = PathBuf::from(
            var("FUNCTION_STORAGE_DIR").unwrap_or_else(|| DEFAULT_STORAGE_DIR.to_string()),
        );
        let db_path = var("FUNCTION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_dir.join(STORE_FILE_NAME));

        let autoscaling_enabled = match var("AUTOSCALING_ENABLED") {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| FaasError::Config(format!("AUTOSCALING_ENABLED: '{value}'")))?,
            None => false,
        };

        let provision_timeout = var("PROVISION_TIMEOUT_SECS")
            .map(|value| parse_secs("PROVISION_TIMEOUT_SECS", &value))
            .transpose()?;
        let execution_timeout = var("EXECUTION_TIMEOUT_SECS")
            .map(|value| parse_secs("EXECUTION_TIMEOUT_SECS", &value))
            .transpose()?;

        Ok(Self {
            listen_addr,
            backend_type,
            worker_image: var("WORKER_IMAGE").unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
            registry_auth,
            storage_dir,
            db_path,
            worker_host: var("WORKER_HOST").unwrap_or_else(|| "localhost".to_string()),
            namespace: var("K8S_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            node_host: var("K8S_NODE_HOST").unwrap_or_else(|| "localhost".to_string()),
            service_account: var("K8S_SERVICE_ACCOUNT"),
            image_pull_secret: var("K8S_IMAGE_PULL_SECRET"),
            autoscaling_enabled,
            provision_timeout,
            execution_timeout,
        })
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            worker_image: self.worker_image.clone(),
            worker_host: self.worker_host.clone(),
            registry_auth: self.registry_auth.clone(),
        }
    }

    pub fn kubernetes_config(&self) -> KubernetesConfig {
        KubernetesConfig {
            namespace: self.namespace.clone(),
            worker_image: self.worker_image.clone(),
            node_host: self.node_host.clone(),
            service_account: self.service_account.clone(),
            image_pull_secret: self.image_pull_secret.clone(),
            autoscaling: self
                .autoscaling_enabled
                .then(AutoscalingPolicy::default),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(FaasError::Config(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServiceConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.backend_type, BackendType::Docker);
        assert_eq!(config.worker_image, "faas-worker:latest");
        assert_eq!(config.db_path, PathBuf::from("/tmp/faas_functions/functions.json"));
        assert!(config.registry_auth.is_none());
        assert!(config.provision_timeout.is_none());
        assert!(config.execution_timeout.is_none());
        assert!(config.kubernetes_config().autoscaling.is_none());
    }

    #[test]
    fn test_kubernetes_settings() {
        let config = config_from(&[
            ("DEPLOYMENT_ENV", "kubernetes"),
            ("K8S_NAMESPACE", "functions"),
            ("K8S_NODE_HOST", "10.0.0.5"),
            ("K8S_IMAGE_PULL_SECRET", "registry-secret"),
            ("AUTOSCALING_ENABLED", "true"),
            ("FUNCTION_STORAGE_DIR", "/var/lib/faas"),
        ])
        .unwrap();

        assert_eq!(config.backend_type, BackendType::Kubernetes);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/faas/functions.json"));

        let kube = config.kubernetes_config();
        assert_eq!(kube.namespace, "functions");
        assert_eq!(kube.node_host, "10.0.0.5");
        assert_eq!(kube.image_pull_secret.as_deref(), Some("registry-secret"));
        assert!(kube.service_account.is_none());
        assert!(kube.autoscaling.is_some());
    }

    #[test]
    fn test_registry_auth_requires_user_and_password() {
        let config = config_from(&[("REGISTRY_URL", "registry.local"), ("REGISTRY_USER", "bot")]).unwrap();
        assert!(config.registry_auth.is_none());

        let config = config_from(&[
            ("REGISTRY_URL", "registry.local"),
            ("REGISTRY_USER", "bot"),
            ("REGISTRY_PASS", "s3cret"),
        ])
        .unwrap();
        let auth = config.docker_config().registry_auth.unwrap();
        assert_eq!(auth.server_address, "registry.local");
        assert_eq!(auth.username, "bot");
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for vars in [
            vec![("DEPLOYMENT_ENV", "nomad")],
            vec![("LISTEN_ADDR", "not-an-addr")],
            vec![("AUTOSCALING_ENABLED", "maybe")],
            vec![("PROVISION_TIMEOUT_SECS", "0")],
            vec![("PROVISION_TIMEOUT_SECS", "soon")],
            vec![("EXECUTION_TIMEOUT_SECS", "-1")],
        ] {
            assert!(matches!(config_from(&vars), Err(FaasError::Config(_))));
        }
    }

    #[test]
    fn test_timeouts() {
        let config = config_from(&[
            ("PROVISION_TIMEOUT_SECS", "90"),
            ("EXECUTION_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.provision_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(30)));
    }
}
