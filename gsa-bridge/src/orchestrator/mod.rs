//! Service lifecycle, hot reload and the connector context.

pub mod context;
pub mod lifecycle;
pub mod reload;
pub mod service;

pub use context::BridgeContext;
pub use lifecycle::LifecycleState;
pub use reload::{
    ReloadListener, ReloadPlan, SAFE_KEYS, ServiceConfigValidator, check_service_config,
};
pub use service::{Orchestrator, OrchestratorBuilder, RESTART_STOP_DELAY};
