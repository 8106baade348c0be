use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::engine::{resolve_seed, simulate_outcomes, summarize};
use super::error::SimError;
use super::types::{CashFlow, InflationSeries, ReturnSeries, SimulationConfig};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalType {
    /// Largest periodic withdrawal whose odds of ruin stay at or below target.
    MaxWithdrawal,
    /// Smallest starting balance whose odds of ruin stay at or below target.
    MinStartValue,
}

#[derive(Debug, Clone, Copy)]
pub struct GoalSolveConfig {
    pub goal_type: GoalType,
    pub target_ruin_pct: f64,
    pub search_min: i64,
    pub search_max: i64,
    pub tolerance: i64,
    pub max_iterations: u32,
    pub trials_per_iteration: u32,
    pub final_trials: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveIteration {
    pub iteration: u32,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub candidate_value: i64,
    pub ruin_probability_pct: f64,
    pub ruin_ci_half_width_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveResult {
    pub goal_type: GoalType,
    pub target_ruin_pct: f64,
    pub search_min: i64,
    pub search_max: i64,
    pub tolerance: i64,
    pub max_iterations: u32,
    pub trials_per_iteration: u32,
    pub final_trials: u32,
    pub seed: u64,
    pub solved_value: Option<i64>,
    pub achieved_ruin_pct: Option<f64>,
    pub achieved_ruin_ci_half_width_pct: Option<f64>,
    pub iterations: Vec<GoalSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Bisects over `[search_min, search_max]` for the goal value. Every
/// evaluation reuses one base seed so neighbouring candidates see the same
/// historical windows.
pub fn solve_goal(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    base: &SimulationConfig,
    config: GoalSolveConfig,
) -> Result<GoalSolveResult, SimError> {
    validate_config(base, config)?;
    base.validate(inflation)?;

    let seed = resolve_seed(base.seed);
    let evaluate = |candidate: i64, trials: u32| {
        evaluate_candidate(returns, inflation, base, config.goal_type, candidate, trials, seed)
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate(config.search_min, config.trials_per_iteration)?;
    let high_eval = evaluate(config.search_max, config.trials_per_iteration)?;
    let meets = |eval: CandidateEval| eval.ruin_pct <= config.target_ruin_pct + 1e-12;

    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    match config.goal_type {
        GoalType::MaxWithdrawal => {
            if !meets(low_eval) {
                feasible = false;
                message = "No feasible withdrawal found within the search bounds.".to_string();
            } else if meets(high_eval) {
                solved_value = Some(config.search_max);
                converged = true;
                feasible = true;
                message = "Upper withdrawal bound is still feasible; increase search max."
                    .to_string();
            } else {
                let mut lo = config.search_min;
                let mut hi = config.search_max;
                let mut it = 0;
                while it < config.max_iterations {
                    it += 1;
                    let mid = lo + (hi - lo) / 2;
                    let eval = evaluate(mid, config.trials_per_iteration)?;
                    iterations.push(iteration_row(it, lo, hi, mid, eval));

                    if meets(eval) {
                        lo = mid;
                    } else {
                        hi = mid;
                    }

                    if hi - lo <= config.tolerance {
                        converged = true;
                        break;
                    }
                }
                solved_value = Some(lo);
                feasible = true;
                message = if converged {
                    "Solved maximum sustainable withdrawal.".to_string()
                } else {
                    "Reached max iterations before tolerance was met; returning best estimate."
                        .to_string()
                };
            }
        }
        GoalType::MinStartValue => {
            if meets(low_eval) {
                solved_value = Some(config.search_min);
                converged = true;
                feasible = true;
                message = "Already meets target at lower start value bound.".to_string();
            } else if !meets(high_eval) {
                feasible = false;
                message = "No feasible start value found within the search bounds.".to_string();
            } else {
                let mut lo = config.search_min;
                let mut hi = config.search_max;
                let mut it = 0;
                while it < config.max_iterations {
                    it += 1;
                    let mid = lo + (hi - lo) / 2;
                    let eval = evaluate(mid, config.trials_per_iteration)?;
                    iterations.push(iteration_row(it, lo, hi, mid, eval));

                    if meets(eval) {
                        hi = mid;
                    } else {
                        lo = mid;
                    }

                    if hi - lo <= config.tolerance {
                        converged = true;
                        break;
                    }
                }
                solved_value = Some(hi);
                feasible = true;
                message = if converged {
                    "Solved minimum start value.".to_string()
                } else {
                    "Reached max iterations before tolerance was met; returning best estimate."
                        .to_string()
                };
            }
        }
    }

    if !converged && feasible {
        warn!(iterations = config.max_iterations, "goal solver did not converge");
    }

    let mut achieved_ruin_pct = None;
    let mut achieved_ruin_ci_half_width_pct = None;
    if let Some(value) = solved_value {
        let final_eval = evaluate(value, config.final_trials)?;
        achieved_ruin_pct = Some(final_eval.ruin_pct);
        achieved_ruin_ci_half_width_pct = Some(final_eval.ci_half_width_pct);
    }

    Ok(GoalSolveResult {
        goal_type: config.goal_type,
        target_ruin_pct: config.target_ruin_pct,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        trials_per_iteration: config.trials_per_iteration,
        final_trials: config.final_trials,
        seed,
        solved_value,
        achieved_ruin_pct,
        achieved_ruin_ci_half_width_pct,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    ruin_pct: f64,
    ci_half_width_pct: f64,
}

fn evaluate_candidate(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    base: &SimulationConfig,
    goal_type: GoalType,
    candidate: i64,
    trials: u32,
    seed: u64,
) -> Result<CandidateEval, SimError> {
    let mut config = base.clone();
    config.trial_count = trials.max(1);
    config.seed = Some(seed);
    match goal_type {
        GoalType::MaxWithdrawal => config.amount = candidate.max(0),
        GoalType::MinStartValue => config.start_value = candidate.max(1),
    }
    config.validate(inflation)?;

    let outcomes = simulate_outcomes(returns, inflation, &config, seed)?;
    let summary = summarize(&outcomes, config.tail_quantile, seed);
    let p = summary.ruin_count as f64 / summary.total_trials as f64;
    debug!(candidate, ruin_pct = summary.ruin_probability_pct, "evaluated goal candidate");

    Ok(CandidateEval {
        ruin_pct: 100.0 * p,
        ci_half_width_pct: 100.0 * binomial_ci_half_width(p, config.trial_count),
    })
}

fn iteration_row(
    iteration: u32,
    lower_bound: i64,
    upper_bound: i64,
    candidate_value: i64,
    eval: CandidateEval,
) -> GoalSolveIteration {
    GoalSolveIteration {
        iteration,
        lower_bound,
        upper_bound,
        candidate_value,
        ruin_probability_pct: eval.ruin_pct,
        ruin_ci_half_width_pct: eval.ci_half_width_pct,
    }
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(base: &SimulationConfig, config: GoalSolveConfig) -> Result<(), SimError> {
    if !(0.0..=100.0).contains(&config.target_ruin_pct) {
        return Err(SimError::Config(
            "target ruin probability must be between 0 and 100".to_string(),
        ));
    }
    if config.search_max <= config.search_min {
        return Err(SimError::Config(
            "search max must be greater than search min".to_string(),
        ));
    }
    match config.goal_type {
        GoalType::MaxWithdrawal => {
            if base.flow != CashFlow::Withdraw {
                return Err(SimError::Config(
                    "withdrawal goal requires a withdrawing cash flow".to_string(),
                ));
            }
            if config.search_min < 0 {
                return Err(SimError::Config("search min must be >= 0".to_string()));
            }
        }
        GoalType::MinStartValue => {
            if config.search_min <= 0 {
                return Err(SimError::Config(
                    "search min must be > 0 for a start value goal".to_string(),
                ));
            }
        }
    }
    if config.tolerance <= 0 {
        return Err(SimError::Config("tolerance must be > 0".to_string()));
    }
    if config.max_iterations == 0 {
        return Err(SimError::Config("max iterations must be > 0".to_string()));
    }
    if config.trials_per_iteration == 0 {
        return Err(SimError::Config(
            "trials per iteration must be > 0".to_string(),
        ));
    }
    if config.final_trials == 0 {
        return Err(SimError::Config("final trials must be > 0".to_string()));
    }
    Ok(())
}
