//! Kubernetes backend: a Deployment, NodePort Service, ConfigMap and optional
//! HorizontalPodAutoscaler per function.
//!
//! Every object name is derived from the function id, so teardown only needs
//! the deployment name handed out as the backend handle.

use crate::{worker_name, OrchestratorError, WORKER_NAME_PREFIX};
use async_trait::async_trait;
use faas_common::{
    CodeStorage, Orchestrator, Provisioned, Result as CommonResult, CODE_MOUNT_PATH,
    HANDLER_ENV_VAR, HANDLER_FILE_NAME, WORKER_PORT,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HPAScalingPolicy, HPAScalingRules, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, LocalObjectReference,
    PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

type Result<T> = std::result::Result<T, OrchestratorError>;

const APP_LABEL: &str = "faas-worker";
const CODE_VOLUME: &str = "handler-volume";
const SERVICE_PORT: i32 = 80;

/// Replica bounds and thresholds for the per-function autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscalingPolicy {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub cpu_utilization: i32,
    pub memory_utilization: i32,
    pub scale_up_window_secs: i32,
    pub scale_down_window_secs: i32,
}

impl Default for AutoscalingPolicy {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 5,
            cpu_utilization: 70,
            memory_utilization: 80,
            scale_up_window_secs: 0,
            scale_down_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub worker_image: String,
    /// Node address clients use together with the NodePort
    pub node_host: String,
    pub service_account: Option<String>,
    pub image_pull_secret: Option<String>,
    /// `None` disables the autoscaler entirely
    pub autoscaling: Option<AutoscalingPolicy>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "faas-workers".to_string(),
            worker_image: "faas-worker:latest".to_string(),
            node_host: "localhost".to_string(),
            service_account: None,
            image_pull_secret: None,
            autoscaling: None,
        }
    }
}

/// Names of every object that belongs to one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub function_id: String,
    pub deployment: String,
    pub service: String,
    pub config_map: String,
    pub autoscaler: String,
}

impl ResourceNames {
    pub fn for_function(function_id: &str) -> Self {
        Self {
            function_id: function_id.to_string(),
            deployment: worker_name(function_id),
            service: format!("service-{function_id}"),
            config_map: format!("handler-code-{function_id}"),
            autoscaler: format!("hpa-{function_id}"),
        }
    }

    /// Rebuild the names from a deployment name handed out by `provision`.
    pub fn from_handle(handle: &str) -> Result<Self> {
        match handle.strip_prefix(WORKER_NAME_PREFIX) {
            Some(function_id) if !function_id.is_empty() => Ok(Self::for_function(function_id)),
            _ => Err(OrchestratorError::InvalidHandle(handle.to_string())),
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), APP_LABEL.to_string()),
            ("func".to_string(), self.function_id.clone()),
        ])
    }
}

fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    api_status(err) == Some(404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    api_status(err) == Some(409)
}

fn kube_err(action: &'static str, resource: &str, source: kube::Error) -> OrchestratorError {
    OrchestratorError::Kube {
        action,
        resource: resource.to_string(),
        source,
    }
}

#[derive(Clone)]
pub struct KubernetesBackend {
    client: Client,
    config: KubernetesConfig,
    code_storage: Arc<dyn CodeStorage>,
}

impl KubernetesBackend {
    pub fn new(client: Client, config: KubernetesConfig, code_storage: Arc<dyn CodeStorage>) -> Self {
        Self {
            client,
            config,
            code_storage,
        }
    }

    /// Build a client from in-cluster credentials, falling back to the local kubeconfig.
    pub async fn connect(
        config: KubernetesConfig,
        code_storage: Arc<dyn CodeStorage>,
    ) -> Result<Self> {
        let client = Client::try_default().await?;
        info!(namespace = %config.namespace, "Connected to Kubernetes API");
        Ok(Self::new(client, config, code_storage))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    #[instrument(skip(self, code_location, handler))]
    async fn run_worker(
        &self,
        function_id: &str,
        code_location: &str,
        handler: &str,
    ) -> Result<Provisioned> {
        let names = ResourceNames::for_function(function_id);
        let code = self
            .code_storage
            .load(code_location)
            .await
            .map_err(OrchestratorError::Code)?;

        match self.create_all(&names, code, handler).await {
            Ok(provisioned) => Ok(provisioned),
            Err(e) => {
                // Nothing refers to a half-built worker once this returns.
                if let Err(cleanup) = self.delete_all(&names).await {
                    warn!(deployment = %names.deployment, error = %cleanup, "Failed to clean up after failed provisioning");
                }
                Err(e)
            }
        }
    }

    async fn create_all(
        &self,
        names: &ResourceNames,
        code: Vec<u8>,
        handler: &str,
    ) -> Result<Provisioned> {
        let ns = &self.config.namespace;

        // ConfigMap: replaced when present so the pod always sees the stored code.
        let config_maps: Api<ConfigMap> = self.api();
        let cm = handler_config_map(names, ns, code);
        match config_maps.create(&PostParams::default(), &cm).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                config_maps
                    .replace(&names.config_map, &PostParams::default(), &cm)
                    .await
                    .map_err(|e| kube_err("replace", &names.config_map, e))?;
            }
            Err(e) => return Err(kube_err("create", &names.config_map, e)),
        }

        let deployments: Api<Deployment> = self.api();
        let deployment = worker_deployment(names, &self.config, handler);
        match deployments.create(&PostParams::default(), &deployment).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                info!(deployment = %names.deployment, "Deployment already exists, reusing it");
            }
            Err(e) => return Err(kube_err("create", &names.deployment, e)),
        }

        let services: Api<Service> = self.api();
        let service = match services
            .create(&PostParams::default(), &worker_service(names, ns))
            .await
        {
            Ok(created) => created,
            Err(e) if is_already_exists(&e) => services
                .get(&names.service)
                .await
                .map_err(|e| kube_err("get", &names.service, e))?,
            Err(e) => return Err(kube_err("create", &names.service, e)),
        };
        let node_port = service_node_port(&service)
            .ok_or_else(|| OrchestratorError::MissingNodePort(names.service.clone()))?;

        if let Some(policy) = &self.config.autoscaling {
            let autoscalers: Api<HorizontalPodAutoscaler> = self.api();
            match autoscalers
                .create(&PostParams::default(), &worker_autoscaler(names, ns, policy))
                .await
            {
                Ok(_) => {}
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(kube_err("create", &names.autoscaler, e)),
            }
        }

        info!(
            deployment = %names.deployment,
            %node_port,
            "Created kubernetes deployment and service"
        );
        Ok(Provisioned {
            backend_handle: names.deployment.clone(),
            endpoint: format!("{}:{}", self.config.node_host, node_port),
        })
    }

    async fn delete_all(&self, names: &ResourceNames) -> Result<()> {
        let autoscalers: Api<HorizontalPodAutoscaler> = self.api();
        match autoscalers
            .delete(&names.autoscaler, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(hpa = %names.autoscaler, error = %e, "Failed to delete autoscaler"),
        }

        let deployments: Api<Deployment> = self.api();
        match deployments
            .delete(&names.deployment, &DeleteParams::foreground())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(kube_err("delete", &names.deployment, e)),
        }

        let services: Api<Service> = self.api();
        match services.delete(&names.service, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(service = %names.service, error = %e, "Failed to delete service"),
        }

        let config_maps: Api<ConfigMap> = self.api();
        match config_maps
            .delete(&names.config_map, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(configmap = %names.config_map, error = %e, "Failed to delete configmap"),
        }

        info!(deployment = %names.deployment, "Deleted kubernetes resources");
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubernetesBackend {
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
        let names =
            ResourceNames::from_handle(backend_handle).map_err(OrchestratorError::into_teardown)?;
        self.delete_all(&names)
            .await
            .map_err(OrchestratorError::into_teardown)
    }

    #[instrument(skip(self))]
    async fn teardown_function(&self, function_id: &str) -> CommonResult<()> {
        self.delete_all(&ResourceNames::for_function(function_id))
            .await
            .map_err(OrchestratorError::into_teardown)
    }
}

fn object_meta(name: &str, namespace: &str, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels,
        ..Default::default()
    }
}

pub(crate) fn handler_config_map(names: &ResourceNames, namespace: &str, code: Vec<u8>) -> ConfigMap {
    let mut cm = ConfigMap {
        metadata: object_meta(&names.config_map, namespace, Some(names.labels())),
        ..Default::default()
    };
    match String::from_utf8(code) {
        Ok(text) => {
            cm.data = Some(BTreeMap::from([(HANDLER_FILE_NAME.to_string(), text)]));
        }
        Err(raw) => {
            cm.binary_data = Some(BTreeMap::from([(
                HANDLER_FILE_NAME.to_string(),
                ByteString(raw.into_bytes()),
            )]));
        }
    }
    cm
}

pub(crate) fn worker_deployment(
    names: &ResourceNames,
    config: &KubernetesConfig,
    handler: &str,
) -> Deployment {
    let labels = names.labels();

    let container = Container {
        name: APP_LABEL.to_string(),
        image: Some(config.worker_image.clone()),
        env: Some(vec![EnvVar {
            name: HANDLER_ENV_VAR.to_string(),
            value: Some(handler.to_string()),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(WORKER_PORT),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: CODE_VOLUME.to_string(),
            mount_path: CODE_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        service_account_name: config.service_account.clone(),
        image_pull_secrets: config.image_pull_secret.as_ref().map(|secret| {
            vec![LocalObjectReference {
                name: secret.clone(),
                ..Default::default()
            }]
        }),
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: CODE_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: names.config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(&names.deployment, &config.namespace, Some(labels.clone())),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn worker_service(names: &ResourceNames, namespace: &str) -> Service {
    Service {
        metadata: object_meta(&names.service, namespace, Some(names.labels())),
        spec: Some(ServiceSpec {
            selector: Some(names.labels()),
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(i32::from(WORKER_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn worker_autoscaler(
    names: &ResourceNames,
    namespace: &str,
    policy: &AutoscalingPolicy,
) -> HorizontalPodAutoscaler {
    let utilization = |resource: &str, percent: i32| MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percent),
                ..Default::default()
            },
        }),
        ..Default::default()
    };

    // Scale up quickly, scale down conservatively.
    let behavior = HorizontalPodAutoscalerBehavior {
        scale_up: Some(HPAScalingRules {
            stabilization_window_seconds: Some(policy.scale_up_window_secs),
            select_policy: Some("Max".to_string()),
            policies: Some(vec![
                HPAScalingPolicy {
                    type_: "Percent".to_string(),
                    value: 100,
                    period_seconds: 15,
                },
                HPAScalingPolicy {
                    type_: "Pods".to_string(),
                    value: 4,
                    period_seconds: 15,
                },
            ]),
            ..Default::default()
        }),
        scale_down: Some(HPAScalingRules {
            stabilization_window_seconds: Some(policy.scale_down_window_secs),
            policies: Some(vec![HPAScalingPolicy {
                type_: "Percent".to_string(),
                value: 50,
                period_seconds: 60,
            }]),
            ..Default::default()
        }),
    };

    HorizontalPodAutoscaler {
        metadata: object_meta(&names.autoscaler, namespace, Some(names.labels())),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: names.deployment.clone(),
            },
            min_replicas: Some(policy.min_replicas),
            max_replicas: policy.max_replicas,
            metrics: Some(vec![
                utilization("cpu", policy.cpu_utilization),
                utilization("memory", policy.memory_utilization),
            ]),
            behavior: Some(behavior),
        }),
        ..Default::default()
    }
}

fn service_node_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find_map(|port| port.node_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_handle() {
        let names = ResourceNames::for_function("abc123");
        assert_eq!(names.deployment, "faas-worker-abc123");
        assert_eq!(names.service, "service-abc123");
        assert_eq!(names.config_map, "handler-code-abc123");
        assert_eq!(names.autoscaler, "hpa-abc123");

        let rebuilt = ResourceNames::from_handle(&names.deployment).unwrap();
        assert_eq!(rebuilt, names);
    }

    #[test]
    fn test_invalid_handles_are_rejected() {
        assert!(ResourceNames::from_handle("faas-worker-").is_err());
        assert!(ResourceNames::from_handle("some-container-id").is_err());
    }

    #[test]
    fn test_config_map_holds_code() {
        let names = ResourceNames::for_function("f1");
        let cm = handler_config_map(&names, "faas-workers", b"def echo(x): return x".to_vec());
        assert_eq!(cm.metadata.name.as_deref(), Some("handler-code-f1"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("faas-workers"));
        assert_eq!(
            cm.data.unwrap()["handler.py"],
            "def echo(x): return x".to_string()
        );

        let binary = handler_config_map(&names, "faas-workers", vec![0xff, 0xfe, 0x00]);
        assert!(binary.data.is_none());
        assert_eq!(binary.binary_data.unwrap()["handler.py"].0, vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn test_deployment_spec() {
        let names = ResourceNames::for_function("f1");
        let config = KubernetesConfig {
            service_account: Some("faas-manager-sa".to_string()),
            image_pull_secret: Some("registry-secret".to_string()),
            ..Default::default()
        };
        let deployment = worker_deployment(&names, &config, "function.handler.echo");

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector["app"], "faas-worker");
        assert_eq!(selector["func"], "f1");

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("faas-manager-sa"));
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "registry-secret");

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("faas-worker:latest"));
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "HANDLER_FUNCTION");
        assert_eq!(env[0].value.as_deref(), Some("function.handler.echo"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8000);
        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/app/function");

        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "handler-code-f1");
    }

    #[test]
    fn test_service_spec() {
        let names = ResourceNames::for_function("f1");
        let service = worker_service(&names, "faas-workers");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.selector.unwrap()["func"], "f1");
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8000)));
    }

    #[test]
    fn test_node_port_lookup() {
        let names = ResourceNames::for_function("f1");
        let mut service = worker_service(&names, "faas-workers");
        assert_eq!(service_node_port(&service), None);

        service.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
        assert_eq!(service_node_port(&service), Some(30080));
    }

    #[test]
    fn test_autoscaler_spec() {
        let names = ResourceNames::for_function("f1");
        let hpa = worker_autoscaler(&names, "faas-workers", &AutoscalingPolicy::default());
        let spec = hpa.spec.unwrap();

        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.scale_target_ref.name, "faas-worker-f1");
        assert_eq!(spec.min_replicas, Some(1));
        assert_eq!(spec.max_replicas, 5);

        let metrics = spec.metrics.unwrap();
        let targets: Vec<(String, Option<i32>)> = metrics
            .iter()
            .map(|m| {
                let r = m.resource.as_ref().unwrap();
                (r.name.clone(), r.target.average_utilization)
            })
            .collect();
        assert_eq!(
            targets,
            vec![("cpu".to_string(), Some(70)), ("memory".to_string(), Some(80))]
        );

        let behavior = spec.behavior.unwrap();
        let up = behavior.scale_up.unwrap().stabilization_window_seconds.unwrap();
        let down = behavior.scale_down.unwrap().stabilization_window_seconds.unwrap();
        assert!(up < down, "scale-down must be slower than scale-up");
    }
}
