//! # HTTP Route Handlers
//!
//! `/optimize` and `/explain` share one pipeline (`run_optimization`):
//!
//! 1. **Resolve**: take the request's catalog (or the server's) and the request's
//!    config (or the session defaults).
//! 2. **Optimize**: run the full optimizer into a fragmented plan.
//! 3. **Render**: produce EXPLAIN text at the requested level.
//!
//! ## Error Handling
//!
//! - 400 Bad Request: the plan or config is invalid (dangling column, CTE cycle,
//!   unknown CTE, out-of-range setting)
//! - 500 Internal Server Error: the optimizer failed on a valid input

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use distx_core::catalog::{Catalog, InMemoryCatalog, StatisticsProvider};
use distx_core::config::OptimizerConfig;
use distx_core::error::OptimizerError;
use distx_core::explain::{explain as render_explain, ExplainLevel};
use distx_core::fragment::{DistributedPlan, PlanFragment};
use distx_core::plan::LogicalQuery;
use distx_core::search::Optimizer;
use tracing::{debug, warn};

use crate::state::AppState;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// GET /rules: registered rules in application order.
pub async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rules: Vec<RuleInfo> = state
        .rule_registry
        .active_rules()
        .iter()
        .map(|r| RuleInfo {
            name: r.name().to_string(),
            rule_type: format!("{:?}", r.rule_type()),
        })
        .collect();

    Json(RulesResponse { rules })
}

#[derive(Serialize)]
pub struct RulesResponse {
    pub rules: Vec<RuleInfo>,
}

#[derive(Serialize)]
pub struct RuleInfo {
    pub name: String,
    pub rule_type: String,
}

/// Request body shared by `/optimize` and `/explain`.
#[derive(Deserialize)]
pub struct OptimizeRequest {
    /// Metadata and statistics of the referenced tables. Falls back to the
    /// server's catalog when absent.
    #[serde(default)]
    pub catalog: Option<InMemoryCatalog>,
    pub query: LogicalQuery,
    /// Session variables; omitted fields keep their defaults.
    #[serde(default)]
    pub config: Option<OptimizerConfig>,
    #[serde(default)]
    pub level: ExplainLevel,
}

#[derive(Serialize)]
pub struct OptimizeResponse {
    pub explain: String,
    pub fragments: Vec<PlanFragment>,
}

#[derive(Serialize)]
pub struct ExplainResponse {
    pub explain: String,
}

/// POST /optimize: EXPLAIN text plus the fragment list.
pub async fn optimize(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OptimizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let level = request.level;
    let plan = run_optimization(&state, request)?;
    Ok(Json(OptimizeResponse {
        explain: render_explain(&plan, level),
        fragments: plan.fragments,
    }))
}

/// POST /explain: EXPLAIN text only.
pub async fn explain(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OptimizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let level = request.level;
    let plan = run_optimization(&state, request)?;
    Ok(Json(ExplainResponse {
        explain: render_explain(&plan, level),
    }))
}

fn error_response(err: OptimizerError) -> (StatusCode, String) {
    if err.is_user_error() {
        debug!("Rejected request: {}", err);
        (StatusCode::BAD_REQUEST, err.to_string())
    } else {
        warn!("Optimization failed: {}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

/// Optimize one request. Every request gets its own optimizer over its own
/// catalog; nothing is shared across requests except the stateless rules and
/// cost model.
fn run_optimization(
    state: &AppState,
    request: OptimizeRequest,
) -> Result<DistributedPlan, (StatusCode, String)> {
    let catalog = match request.catalog {
        Some(catalog) => Arc::new(catalog),
        None => state.catalog.clone(),
    };
    let config = request.config.unwrap_or_else(|| state.config.clone());

    let metadata: Arc<dyn Catalog> = catalog.clone();
    let statistics: Arc<dyn StatisticsProvider> = catalog;
    let optimizer = Optimizer::new(
        state.rule_registry.clone(),
        state.cost_model.clone(),
        metadata,
        statistics,
    );
    optimizer
        .optimize(&request.query, &config)
        .map_err(error_response)
}
