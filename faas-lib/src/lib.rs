//! Function lifecycle management: provisions workers for uploaded code, keeps
//! their records in step with the backend across restarts and proxies
//! invocations to them.

pub mod api_routes;
pub mod config;
pub mod manager;
pub mod proxy;
pub mod store;

pub use config::ServiceConfig;
pub use manager::{FunctionManager, Outcome, ReconcileReport};
pub use proxy::WorkerClient;
pub use store::{FunctionStore, InMemoryFunctionStore, JsonFileFunctionStore};

pub use faas_common as common;
pub use faas_orchestrator as orchestrator;
