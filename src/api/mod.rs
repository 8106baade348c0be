mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    CashFlow, GoalSolveConfig, GoalType, PlanConfig, PlanSummary, RateSeries, RuinCriterion,
    RuinPolicy, SimError, SimulationConfig, SimulationSummary, run_plan, run_simulation,
    solve_goal, sweep_contributions,
};
use crate::history::percent_to_decimal;

use cli::{
    DEFAULT_FINAL_TRIALS, DEFAULT_MAX_ITERATIONS, DEFAULT_TARGET_RUIN_PCT, DEFAULT_TOLERANCE,
    DEFAULT_TRIALS_PER_ITERATION, PlanOptions, SimArgs, build_config, build_plan,
};
pub use cli::{Cli, Command, run};

/// History loaded at startup; requests may override it with inline series.
#[derive(Debug)]
struct AppState {
    returns: RateSeries,
    inflation: Option<RateSeries>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    trials: Option<u32>,
    min_duration: Option<u32>,
    mode_duration: Option<u32>,
    cutoff_date: Option<NaiveDate>,
    max_duration: Option<u32>,
    start_value: Option<i64>,
    amount: Option<i64>,
    flow: Option<CashFlow>,
    inflation_adjusted: Option<bool>,
    ruin_policy: Option<RuinPolicy>,
    ruin_criterion: Option<RuinCriterion>,
    tail_percentile: Option<f64>,
    seed: Option<u64>,

    /// Inline percentages replacing the server's return history.
    returns: Option<Vec<f64>>,
    /// Inline percentages replacing the server's inflation history.
    inflation: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    #[serde(flatten)]
    retirement: SimulatePayload,
    accumulation_years: Option<u32>,
    contribution: Option<i64>,
    escalate_contribution: Option<bool>,
    sweep: Option<Vec<i64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    #[serde(flatten)]
    base: SimulatePayload,
    goal: Option<GoalType>,
    target_ruin_pct: Option<f64>,
    search_min: Option<i64>,
    search_max: Option<i64>,
    tolerance: Option<i64>,
    max_iterations: Option<u32>,
    trials_per_iteration: Option<u32>,
    final_trials: Option<u32>,
}

#[derive(Debug)]
struct SimulateRequest {
    returns: RateSeries,
    inflation: Option<RateSeries>,
    config: SimulationConfig,
}

#[derive(Debug)]
struct PlanRequest {
    returns: RateSeries,
    inflation: Option<RateSeries>,
    plan: PlanConfig,
    sweep: Option<Vec<i64>>,
}

#[derive(Debug)]
struct SolveRequest {
    returns: RateSeries,
    inflation: Option<RateSeries>,
    base: SimulationConfig,
    goal: GoalSolveConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    config: SimulationConfig,
    summary: SimulationSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    plan: PlanConfig,
    results: Vec<PlanSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    return_periods: usize,
    inflation_periods: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Simulation(SimError),
    Worker(String),
}

impl From<SimError> for ApiError {
    fn from(value: SimError) -> Self {
        ApiError::Simulation(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Simulation(err @ SimError::Config(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Simulation(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            ApiError::Worker(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            warn!(%status, error = %msg, "request failed");
        }
        error_response(status, &msg)
    }
}

pub async fn run_http_server(
    port: u16,
    returns: RateSeries,
    inflation: Option<RateSeries>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(Arc::new(AppState { returns, inflation }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nestegg HTTP API listening");
    info!("local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, app).await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/plan", post(plan_handler))
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            return_periods: state.returns.len(),
            inflation_periods: state.inflation.as_ref().map(RateSeries::len),
        },
    )
}

async fn simulate_get_handler(
    State(state): State<Arc<AppState>>,
    Query(payload): Query<SimulatePayload>,
) -> Result<Response, ApiError> {
    simulate_handler_impl(&state, payload).await
}

async fn simulate_post_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SimulatePayload>,
) -> Result<Response, ApiError> {
    simulate_handler_impl(&state, payload).await
}

async fn simulate_handler_impl(
    state: &AppState,
    payload: SimulatePayload,
) -> Result<Response, ApiError> {
    let request =
        simulate_request_from_payload(state, payload, today()).map_err(ApiError::BadRequest)?;
    let response = run_blocking(move || {
        let summary =
            run_simulation(&request.returns, request.inflation.as_ref(), &request.config)?;
        Ok(SimulateResponse {
            config: request.config,
            summary,
        })
    })
    .await?;
    Ok(json_response(StatusCode::OK, response))
}

async fn plan_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PlanPayload>,
) -> Result<Response, ApiError> {
    let request =
        plan_request_from_payload(&state, payload, today()).map_err(ApiError::BadRequest)?;
    let response = run_blocking(move || {
        let inflation = request.inflation.as_ref();
        let results = match &request.sweep {
            Some(levels) => {
                sweep_contributions(&request.returns, inflation, &request.plan, levels)?
            }
            None => vec![run_plan(&request.returns, inflation, &request.plan)?],
        };
        Ok(PlanResponse {
            plan: request.plan,
            results,
        })
    })
    .await?;
    Ok(json_response(StatusCode::OK, response))
}

async fn solve_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SolvePayload>,
) -> Result<Response, ApiError> {
    let request =
        solve_request_from_payload(&state, payload, today()).map_err(ApiError::BadRequest)?;
    let result = run_blocking(move || {
        solve_goal(
            &request.returns,
            request.inflation.as_ref(),
            &request.base,
            request.goal,
        )
    })
    .await?;
    Ok(json_response(StatusCode::OK, result))
}

/// Simulations are CPU bound; keep them off the async workers.
async fn run_blocking<T, F>(job: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, SimError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ApiError::Worker(format!("simulation worker failed: {e}")))?
        .map_err(ApiError::from)
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

impl SimulatePayload {
    fn sim_args(&self) -> Result<SimArgs, String> {
        if self.cutoff_date.is_some() && self.mode_duration.is_some() {
            return Err("cutoffDate and modeDuration cannot both be set".to_string());
        }
        Ok(SimArgs {
            trials: self.trials,
            min_duration: self.min_duration,
            mode_duration: self.mode_duration,
            cutoff_date: self.cutoff_date,
            max_duration: self.max_duration,
            start_value: self.start_value,
            amount: self.amount,
            contribute: self.flow == Some(CashFlow::Contribute),
            flat_amount: self.inflation_adjusted == Some(false),
            ruin_policy: self.ruin_policy.map(Into::into),
            ruin_criterion: self.ruin_criterion.map(Into::into),
            tail_percentile: self.tail_percentile,
            seed: self.seed,
        })
    }

    fn resolve_series(
        &mut self,
        state: &AppState,
    ) -> Result<(RateSeries, Option<RateSeries>), String> {
        let returns = match self.returns.take() {
            Some(pcts) => inline_series("returns", pcts)?,
            None => state.returns.clone(),
        };
        let inflation = match self.inflation.take() {
            Some(pcts) => Some(inline_series("inflation", pcts)?),
            None => state.inflation.clone(),
        };
        Ok((returns, inflation))
    }
}

fn inline_series(name: &str, pcts: Vec<f64>) -> Result<RateSeries, String> {
    RateSeries::new(pcts.into_iter().map(percent_to_decimal).collect())
        .map_err(|e| format!("{name}: {e}"))
}

fn simulate_request_from_payload(
    state: &AppState,
    mut payload: SimulatePayload,
    today: NaiveDate,
) -> Result<SimulateRequest, String> {
    let (returns, inflation) = payload.resolve_series(state)?;
    let config = build_config(
        &payload.sim_args()?,
        SimulationConfig::default(),
        inflation.is_some(),
        today,
    )?;
    Ok(SimulateRequest {
        returns,
        inflation,
        config,
    })
}

fn plan_request_from_payload(
    state: &AppState,
    mut payload: PlanPayload,
    today: NaiveDate,
) -> Result<PlanRequest, String> {
    let (returns, inflation) = payload.retirement.resolve_series(state)?;
    let options = PlanOptions {
        accumulation_years: payload.accumulation_years,
        contribution: payload.contribution,
        escalate_contribution: payload.escalate_contribution.unwrap_or(false),
        sweep: payload.sweep,
    };
    let plan = build_plan(
        &payload.retirement.sim_args()?,
        &options,
        inflation.is_some(),
        today,
    )?;
    Ok(PlanRequest {
        returns,
        inflation,
        plan,
        sweep: options.sweep,
    })
}

fn solve_request_from_payload(
    state: &AppState,
    mut payload: SolvePayload,
    today: NaiveDate,
) -> Result<SolveRequest, String> {
    let (returns, inflation) = payload.base.resolve_series(state)?;
    let base = build_config(
        &payload.base.sim_args()?,
        SimulationConfig::default(),
        inflation.is_some(),
        today,
    )?;
    let Some(search_max) = payload.search_max else {
        return Err("searchMax is required".to_string());
    };
    let goal = GoalSolveConfig {
        goal_type: payload.goal.unwrap_or(GoalType::MaxWithdrawal),
        target_ruin_pct: payload.target_ruin_pct.unwrap_or(DEFAULT_TARGET_RUIN_PCT),
        search_min: payload.search_min.unwrap_or(0),
        search_max,
        tolerance: payload.tolerance.unwrap_or(DEFAULT_TOLERANCE),
        max_iterations: payload.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
        trials_per_iteration: payload
            .trials_per_iteration
            .unwrap_or(DEFAULT_TRIALS_PER_ITERATION),
        final_trials: payload.final_trials.unwrap_or(DEFAULT_FINAL_TRIALS),
    };
    Ok(SolveRequest {
        returns,
        inflation,
        base,
        goal,
    })
}
