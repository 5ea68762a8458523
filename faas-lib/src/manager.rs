//! Function lifecycle: creation, invocation, removal and the start/stop
//! reconciliation passes.

use crate::proxy::WorkerClient;
use crate::store::FunctionStore;
use dashmap::DashMap;
use faas_common::{
    new_function_id, CodeStorage, FaasError, Function, FunctionStatus, Orchestrator, Provisioned,
    Result,
};
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn, Span};

/// What happened to one record during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Re-provisioned and persisted as running at a fresh endpoint.
    Restarted { endpoint: String },
    /// Re-provisioning failed; the record is now stopped.
    Stopped { error: String },
    TornDown,
    TeardownFailed { error: String },
    /// The backend side was handled but the record could not be written.
    PersistFailed { error: String },
    /// The record was removed or left the running state before its turn.
    Skipped,
}

/// Per-record outcomes of a restart or cleanup pass, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl ReconcileReport {
    fn push(&mut self, function_id: &str, outcome: Outcome) {
        self.outcomes.push((function_id.to_string(), outcome));
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcome(&self, function_id: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == function_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn restarted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Restarted { .. }))
    }

    pub fn stopped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Stopped { .. }))
    }

    pub fn torn_down(&self) -> usize {
        self.count(|o| matches!(o, Outcome::TornDown))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped))
    }

    /// Teardown and persistence failures.
    pub fn failed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                Outcome::TeardownFailed { .. } | Outcome::PersistFailed { .. }
            )
        })
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Owns the function records and keeps them consistent with the backend.
///
/// Operations on the same function id are serialized through a per-id lock:
/// adds, removals and restarts take it exclusively, invocations share it.
/// An invocation holds its share until the worker answers, so a removal waits
/// for in-flight calls. Set a request timeout on the [`WorkerClient`] to bound
/// that wait when workers can hang.
pub struct FunctionManager {
    store: Arc<dyn FunctionStore>,
    code: Arc<dyn CodeStorage>,
    orchestrator: Arc<dyn Orchestrator>,
    worker: WorkerClient,
    locks: DashMap<String, Arc<RwLock<()>>>,
    provision_timeout: Option<Duration>,
}

impl FunctionManager {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        code: Arc<dyn CodeStorage>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            store,
            code,
            orchestrator,
            worker: WorkerClient::new(),
            locks: DashMap::new(),
            provision_timeout: None,
        }
    }

    pub fn with_worker_client(mut self, worker: WorkerClient) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.provision_timeout = timeout;
        self
    }

    fn lock_for(&self, function_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(function_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn provision(&self, function: &Function) -> Result<Provisioned> {
        let call = self.orchestrator.provision(
            &function.id,
            &function.code_location,
            &function.handler,
        );
        let Some(limit) = self.provision_timeout else {
            return call.await;
        };
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                // The abandoned call may already have created resources.
                warn!(function_id = %function.id, "Provisioning timed out, removing partial worker");
                if let Err(e) = self.orchestrator.teardown_function(&function.id).await {
                    warn!(function_id = %function.id, error = %e, "Cleanup after provisioning timeout failed");
                }
                Err(FaasError::Provision(format!(
                    "provisioning {} timed out after {}s",
                    function.id,
                    limit.as_secs_f64()
                )))
            }
        }
    }

    /// Store the code, create the record and bring up a worker for it.
    ///
    /// On a provisioning failure the record is kept with status `Error` and
    /// the error is returned.
    #[instrument(skip(self, code), fields(function_id, code_len = code.len()))]
    pub async fn add_function(&self, name: &str, handler: &str, code: &[u8]) -> Result<Function> {
        if name.trim().is_empty() {
            return Err(FaasError::Validation("function name is required".to_string()));
        }
        if handler.trim().is_empty() {
            return Err(FaasError::Validation("handler is required".to_string()));
        }
        if code.is_empty() {
            return Err(FaasError::Validation("function code is empty".to_string()));
        }

        let id = new_function_id();
        Span::current().record("function_id", id.as_str());
        let lock = self.lock_for(&id);
        let _guard = lock.write().await;

        let location = self.code.store(&id, code).await?;
        let mut function = Function::new(
            id.clone(),
            name.to_string(),
            handler.to_string(),
            location,
        );
        if let Err(e) = self.store.upsert(&function).await {
            if let Err(cleanup) = self.code.delete(&function.code_location).await {
                warn!(function_id = %id, error = %cleanup, "Failed to delete code of unsaved function");
            }
            return Err(e);
        }
        debug!(function_id = %id, location = %function.code_location, "Function record created");

        match self.provision(&function).await {
            Ok(provisioned) => {
                function.mark_running(provisioned);
                if let Err(e) = self.store.upsert(&function).await {
                    error!(function_id = %id, error = %e, "Failed to persist running function, tearing down worker");
                    if let Err(teardown) = self.orchestrator.teardown(function.handle_or_empty()).await {
                        warn!(function_id = %id, error = %teardown, "Teardown after persist failure failed");
                    }
                    function.mark_failed(FunctionStatus::Error);
                    if let Err(persist) = self.store.upsert(&function).await {
                        error!(function_id = %id, error = %persist, "Failed to record provisioning failure");
                    }
                    return Err(e);
                }
                info!(function_id = %id, endpoint = ?function.endpoint, "Function deployed");
                Ok(function)
            }
            Err(e) => {
                error!(function_id = %id, error = %e, "Provisioning failed");
                function.mark_failed(FunctionStatus::Error);
                if let Err(persist) = self.store.upsert(&function).await {
                    error!(function_id = %id, error = %persist, "Failed to record provisioning failure");
                }
                Err(e)
            }
        }
    }

    /// Forward `payload` to the function's worker and return its raw result.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn execute_function(&self, function_id: &str, payload: &str) -> Result<Box<RawValue>> {
        let lock = self.lock_for(function_id);
        let _guard = lock.read().await;

        let Some(function) = self.store.get(function_id).await? else {
            self.locks.remove(function_id);
            return Err(FaasError::NotFound(function_id.to_string()));
        };

        let Some(endpoint) = function.live_endpoint() else {
            return Err(FaasError::NotRunning(format!(
                "{} is {}",
                function_id, function.status
            )));
        };

        debug!(%function_id, %endpoint, "Invoking worker");
        self.worker.invoke(endpoint, payload).await
    }

    pub async fn list_functions(&self) -> Result<Vec<Function>> {
        self.store.list().await
    }

    pub async fn get_function(&self, function_id: &str) -> Result<Function> {
        self.store
            .get(function_id)
            .await?
            .ok_or_else(|| FaasError::NotFound(function_id.to_string()))
    }

    /// Tear down the worker and delete the code and record.
    ///
    /// Only a failure to delete the record is returned; backend and code
    /// cleanup failures are logged.
    #[instrument(skip(self))]
    pub async fn remove_function(&self, function_id: &str) -> Result<()> {
        let lock = self.lock_for(function_id);
        let result = {
            let _guard = lock.write().await;
            self.remove_locked(function_id).await
        };
        // Ids are never reused, so a gone record no longer needs its lock.
        if matches!(result, Ok(()) | Err(FaasError::NotFound(_))) {
            self.locks.remove(function_id);
        }
        result
    }

    async fn remove_locked(&self, function_id: &str) -> Result<()> {
        let function = self
            .store
            .get(function_id)
            .await?
            .ok_or_else(|| FaasError::NotFound(function_id.to_string()))?;

        if let Err(e) = self.orchestrator.teardown(function.handle_or_empty()).await {
            warn!(%function_id, error = %e, "Teardown failed, removing record anyway");
        }
        if let Err(e) = self.code.delete(&function.code_location).await {
            warn!(%function_id, error = %e, "Failed to delete function code");
        }
        self.store.delete(function_id).await?;
        info!(%function_id, "Function removed");
        Ok(())
    }

    /// Re-provision every function recorded as running.
    ///
    /// Meant for process start, when the previous workers may be gone. Each
    /// record is handled independently; a failure marks it `Stopped`.
    #[instrument(skip(self))]
    pub async fn restart_running_functions(&self) -> Result<ReconcileReport> {
        let running = self.store.list_by_status(FunctionStatus::Running).await?;
        info!(count = running.len(), "Restarting running functions");

        let mut report = ReconcileReport::default();
        for candidate in running {
            let id = candidate.id.clone();
            let lock = self.lock_for(&id);
            let _guard = lock.write().await;

            let mut function = match self.store.get(&id).await {
                Ok(Some(f)) if f.status == FunctionStatus::Running => f,
                Ok(_) => {
                    debug!(function_id = %id, "Function changed before restart, skipping");
                    report.push(&id, Outcome::Skipped);
                    continue;
                }
                Err(e) => {
                    report.push(&id, Outcome::PersistFailed { error: e.to_string() });
                    continue;
                }
            };

            let outcome = match self.provision(&function).await {
                Ok(provisioned) => {
                    let endpoint = provisioned.endpoint.clone();
                    function.mark_running(provisioned);
                    match self.store.upsert(&function).await {
                        Ok(()) => {
                            info!(function_id = %id, %endpoint, "Function restarted");
                            Outcome::Restarted { endpoint }
                        }
                        Err(e) => {
                            error!(function_id = %id, error = %e, "Failed to persist restarted function");
                            if let Err(teardown) =
                                self.orchestrator.teardown(function.handle_or_empty()).await
                            {
                                warn!(function_id = %id, error = %teardown, "Teardown after persist failure failed");
                            }
                            Outcome::PersistFailed { error: e.to_string() }
                        }
                    }
                }
                Err(e) => {
                    warn!(function_id = %id, error = %e, "Restart failed, marking function stopped");
                    function.mark_failed(FunctionStatus::Stopped);
                    match self.store.upsert(&function).await {
                        Ok(()) => Outcome::Stopped { error: e.to_string() },
                        Err(persist) => {
                            error!(function_id = %id, error = %persist, "Failed to mark function stopped");
                            Outcome::PersistFailed { error: persist.to_string() }
                        }
                    }
                }
            };
            report.push(&id, outcome);
        }

        info!(
            restarted = report.restarted(),
            stopped = report.stopped(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Restart pass finished"
        );
        Ok(report)
    }

    /// Tear down the workers of every running function, leaving records as
    /// they are so the next start can bring them back.
    #[instrument(skip(self))]
    pub async fn cleanup_all_functions(&self) -> Result<ReconcileReport> {
        let running = self.store.list_by_status(FunctionStatus::Running).await?;
        info!(count = running.len(), "Cleaning up running functions");

        let mut report = ReconcileReport::default();
        for function in running {
            let lock = self.lock_for(&function.id);
            let _guard = lock.write().await;

            let outcome = match self.orchestrator.teardown(function.handle_or_empty()).await {
                Ok(()) => Outcome::TornDown,
                Err(e) => {
                    warn!(function_id = %function.id, error = %e, "Cleanup teardown failed");
                    Outcome::TeardownFailed { error: e.to_string() }
                }
            };
            report.push(&function.id, outcome);
        }

        info!(
            torn_down = report.torn_down(),
            failed = report.failed(),
            "Cleanup pass finished"
        );
        Ok(report)
    }
}
