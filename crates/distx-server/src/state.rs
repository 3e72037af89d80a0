//! # Application State
//!
//! Created once at startup and shared via `Arc` by every request handler.
//!
//! - **Rule Registry**: the built-in rules. Rules are stateless, so one registry
//!   serves all requests.
//! - **Cost Model**: stateless as well.
//! - **Catalog**: used when a request carries no catalog of its own. Empty by
//!   default; requests normally ship the metadata of the tables they reference.
//! - **Optimizer Config**: session defaults, overridable per request.

use distx_core::catalog::InMemoryCatalog;
use distx_core::config::OptimizerConfig;
use distx_core::cost::{CostModel, DefaultCostModel};
use distx_core::rule::RuleRegistry;
use std::sync::Arc;

pub struct AppState {
    pub rule_registry: Arc<RuleRegistry>,
    pub cost_model: Arc<dyn CostModel>,
    pub catalog: Arc<InMemoryCatalog>,
    pub config: OptimizerConfig,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            rule_registry: Arc::new(distx_rules::default_rule_registry()),
            cost_model: Arc::new(DefaultCostModel::default()),
            catalog: Arc::new(InMemoryCatalog::new()),
            config: OptimizerConfig::default(),
        }
    }
}
