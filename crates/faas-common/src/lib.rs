// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod storage;

pub use storage::{CodeStorage, LocalCodeStorage};

/// Port every worker image listens on inside its container or pod.
pub const WORKER_PORT: u16 = 8000;
/// Environment variable through which the worker learns its entry point.
pub const HANDLER_ENV_VAR: &str = "HANDLER_FUNCTION";
/// In-container path the function's code is mounted at.
pub const CODE_MOUNT_PATH: &str = "/app/function";
/// File name of the uploaded handler inside a code location.
pub const HANDLER_FILE_NAME: &str = "handler.py";

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Function Not Found: {0}")]
    NotFound(String),

    #[error("Provision Error: {0}")]
    Provision(String),

    #[error("Teardown Error: {0}")]
    Teardown(String),

    #[error("Function Not Running: {0}")]
    NotRunning(String),

    #[error("Execution Error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while proxying an invocation to a live worker.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("worker unreachable: {0}")]
    Transport(String),

    #[error("worker returned non-200 status: {status} - {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("malformed worker response: {0}")]
    MalformedResponse(String),
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl FunctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Creating => "creating",
            FunctionStatus::Running => "running",
            FunctionStatus::Stopped => "stopped",
            FunctionStatus::Error => "error",
        }
    }
}

impl Display for FunctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployed function and the last known state of its worker.
///
/// `backend_handle` and `endpoint` are only meaningful while `status` is
/// [`FunctionStatus::Running`]; use [`Function::live_endpoint`] instead of
/// reading `endpoint` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub handler: String,
    pub code_location: String,
    #[serde(default)]
    pub backend_handle: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub status: FunctionStatus,
    pub created_at: DateTime<Utc>,
}

impl Function {
    /// New record in `Creating` with nothing provisioned yet.
    pub fn new(id: String, name: String, handler: String, code_location: String) -> Self {
        Self {
            id,
            name,
            handler,
            code_location,
            backend_handle: None,
            endpoint: None,
            status: FunctionStatus::Creating,
            created_at: Utc::now(),
        }
    }

    /// Endpoint of the worker, only if the function is running.
    pub fn live_endpoint(&self) -> Option<&str> {
        match self.status {
            FunctionStatus::Running => self.endpoint.as_deref().filter(|e| !e.is_empty()),
            _ => None,
        }
    }

    /// Backend handle to pass to [`Orchestrator::teardown`]; empty when nothing was provisioned.
    pub fn handle_or_empty(&self) -> &str {
        self.backend_handle.as_deref().unwrap_or_default()
    }

    pub fn mark_running(&mut self, provisioned: Provisioned) {
        self.backend_handle = Some(provisioned.backend_handle);
        self.endpoint = Some(provisioned.endpoint);
        self.status = FunctionStatus::Running;
    }

    pub fn mark_failed(&mut self, status: FunctionStatus) {
        self.endpoint = None;
        self.status = status;
    }
}

/// Fresh opaque function id.
pub fn new_function_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// What a backend hands back after a successful provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub backend_handle: String,
    pub endpoint: String,
}

impl Display for Provisioned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Provisioned(handle: {}, endpoint: {})",
            self.backend_handle, self.endpoint
        )
    }
}

/// Provisioning backend capable of running one worker per function.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create (or replace) the resources backing `function_id`.
    ///
    /// Calling this again for the same id after a failure must work: any
    /// stale resource with the same derived name is cleared first.
    async fn provision(
        &self,
        function_id: &str,
        code_location: &str,
        handler: &str,
    ) -> Result<Provisioned>;

    /// Remove the resources identified by `backend_handle`.
    ///
    /// Idempotent: an empty handle or already absent resources are success.
    async fn teardown(&self, backend_handle: &str) -> Result<()>;

    /// Remove whatever resources derive from `function_id`, for when a
    /// provisioning attempt was abandoned before it produced a handle.
    ///
    /// Idempotent like [`Orchestrator::teardown`].
    async fn teardown_function(&self, function_id: &str) -> Result<()>;
}
