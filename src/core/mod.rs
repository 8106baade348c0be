mod engine;
mod error;
mod solver;
mod types;

pub use engine::{run_plan, run_simulation, run_trial, summarize, sweep_contributions};
pub use error::SimError;
pub use solver::{GoalSolveConfig, GoalSolveIteration, GoalSolveResult, GoalType, solve_goal};
pub use types::{
    CashFlow, InflationSeries, PlanConfig, PlanSummary, RateSeries, ReturnSeries, RuinCriterion,
    RuinPolicy, SimulationConfig, SimulationSummary, TrialOutcome,
};
