use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::core::{
    CashFlow, GoalSolveConfig, GoalType, PlanConfig, RateSeries, RuinCriterion, RuinPolicy,
    SimulationConfig, run_plan, run_simulation, solve_goal, sweep_contributions,
};
use crate::history::{days_until_cutoff, read_percent_series};
use crate::report::{render_goal, render_plan, render_simulation, render_sweep};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliRuinPolicy {
    StopAndClamp,
    ContinueCompounding,
}

impl From<CliRuinPolicy> for RuinPolicy {
    fn from(value: CliRuinPolicy) -> Self {
        match value {
            CliRuinPolicy::StopAndClamp => RuinPolicy::StopAndClamp,
            CliRuinPolicy::ContinueCompounding => RuinPolicy::ContinueCompounding,
        }
    }
}

impl From<RuinPolicy> for CliRuinPolicy {
    fn from(value: RuinPolicy) -> Self {
        match value {
            RuinPolicy::StopAndClamp => CliRuinPolicy::StopAndClamp,
            RuinPolicy::ContinueCompounding => CliRuinPolicy::ContinueCompounding,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliRuinCriterion {
    Depletion,
    Shortfall,
}

impl From<CliRuinCriterion> for RuinCriterion {
    fn from(value: CliRuinCriterion) -> Self {
        match value {
            CliRuinCriterion::Depletion => RuinCriterion::Depletion,
            CliRuinCriterion::Shortfall => RuinCriterion::Shortfall,
        }
    }
}

impl From<RuinCriterion> for CliRuinCriterion {
    fn from(value: RuinCriterion) -> Self {
        match value {
            RuinCriterion::Depletion => CliRuinCriterion::Depletion,
            RuinCriterion::Shortfall => CliRuinCriterion::Shortfall,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliGoalType {
    MaxWithdrawal,
    MinStartValue,
}

impl From<CliGoalType> for GoalType {
    fn from(value: CliGoalType) -> Self {
        match value {
            CliGoalType::MaxWithdrawal => GoalType::MaxWithdrawal,
            CliGoalType::MinStartValue => GoalType::MinStartValue,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Monte Carlo odds-of-ruin estimator over resampled historical returns"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the ruin simulation and print a summary
    Simulate(SimulateArgs),
    /// Simulate saving years followed by a retirement drawdown
    Plan(PlanArgs),
    /// Search for the largest withdrawal or smallest start value meeting a ruin target
    Solve(SolveArgs),
    /// Serve the JSON HTTP API
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SeriesArgs {
    /// File of periodic returns, one percentage per line
    #[arg(long, env = "NESTEGG_RETURNS")]
    pub returns: PathBuf,
    /// File of periodic inflation rates, one percentage per line
    #[arg(long, env = "NESTEGG_INFLATION")]
    pub inflation: Option<PathBuf>,
}

impl SeriesArgs {
    pub fn load(&self) -> Result<(RateSeries, Option<RateSeries>)> {
        let returns =
            read_percent_series(&self.returns).context("failed to load return history")?;
        let inflation = self
            .inflation
            .as_deref()
            .map(read_percent_series)
            .transpose()
            .context("failed to load inflation history")?;
        Ok((returns, inflation))
    }
}

/// Simulation options. Unset options keep the defaults of the subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct SimArgs {
    #[arg(long, env = "NESTEGG_TRIALS", help = "Number of trials")]
    pub trials: Option<u32>,
    #[arg(long, env = "NESTEGG_MIN_DURATION", help = "Minimum periods per trial")]
    pub min_duration: Option<u32>,
    #[arg(long, env = "NESTEGG_MODE_DURATION", help = "Most likely periods per trial")]
    pub mode_duration: Option<u32>,
    #[arg(
        long,
        conflicts_with = "mode_duration",
        help = "Use the days from today until this date (YYYY-MM-DD) as the most likely duration"
    )]
    pub cutoff_date: Option<NaiveDate>,
    #[arg(long, env = "NESTEGG_MAX_DURATION", help = "Maximum periods per trial")]
    pub max_duration: Option<u32>,
    #[arg(long, env = "NESTEGG_START_VALUE", help = "Starting balance")]
    pub start_value: Option<i64>,
    #[arg(
        long,
        env = "NESTEGG_AMOUNT",
        help = "Periodic withdrawal (or contribution with --contribute) in today's money"
    )]
    pub amount: Option<i64>,
    #[arg(long, help = "Add the periodic amount instead of withdrawing it")]
    pub contribute: bool,
    #[arg(
        long,
        help = "Keep the periodic amount constant instead of escalating it with inflation"
    )]
    pub flat_amount: bool,
    #[arg(long, value_enum)]
    pub ruin_policy: Option<CliRuinPolicy>,
    #[arg(long, value_enum)]
    pub ruin_criterion: Option<CliRuinCriterion>,
    #[arg(
        long,
        env = "NESTEGG_TAIL_PERCENTILE",
        help = "Percentile of the loss distribution to report, e.g. 95"
    )]
    pub tail_percentile: Option<f64>,
    #[arg(long, env = "NESTEGG_SEED")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub series: SeriesArgs,
    #[command(flatten)]
    pub sim: SimArgs,
    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub series: SeriesArgs,
    #[command(flatten)]
    pub sim: SimArgs,
    #[command(flatten)]
    pub plan: PlanOptions,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PlanOptions {
    #[arg(
        long,
        env = "NESTEGG_ACCUMULATION_YEARS",
        help = "Years of saving before retirement"
    )]
    pub accumulation_years: Option<u32>,
    #[arg(
        long,
        env = "NESTEGG_CONTRIBUTION",
        help = "Annual contribution while saving"
    )]
    pub contribution: Option<i64>,
    #[arg(long, help = "Escalate the contribution with inflation")]
    pub escalate_contribution: bool,
    #[arg(
        long,
        env = "NESTEGG_SWEEP",
        value_delimiter = ',',
        help = "Comma-separated contribution levels to compare, e.g. 1200,2400,3600"
    )]
    pub sweep: Option<Vec<i64>>,
}

#[derive(Args, Debug)]
pub struct SolveArgs {
    #[command(flatten)]
    pub series: SeriesArgs,
    #[command(flatten)]
    pub sim: SimArgs,
    #[command(flatten)]
    pub goal: GoalOptions,
    #[arg(long)]
    pub json: bool,
}

pub(crate) const DEFAULT_TARGET_RUIN_PCT: f64 = 5.0;
pub(crate) const DEFAULT_TOLERANCE: i64 = 100;
pub(crate) const DEFAULT_MAX_ITERATIONS: u32 = 40;
pub(crate) const DEFAULT_TRIALS_PER_ITERATION: u32 = 5_000;
pub(crate) const DEFAULT_FINAL_TRIALS: u32 = 50_000;

#[derive(Args, Debug, Clone)]
pub struct GoalOptions {
    #[arg(long, env = "NESTEGG_GOAL", value_enum, default_value_t = CliGoalType::MaxWithdrawal)]
    pub goal: CliGoalType,
    #[arg(
        long,
        env = "NESTEGG_TARGET_RUIN",
        default_value_t = DEFAULT_TARGET_RUIN_PCT,
        help = "Acceptable odds of ruin in percent"
    )]
    pub target_ruin: f64,
    #[arg(long, env = "NESTEGG_SEARCH_MIN", default_value_t = 0)]
    pub search_min: i64,
    #[arg(long, env = "NESTEGG_SEARCH_MAX")]
    pub search_max: i64,
    #[arg(long, env = "NESTEGG_TOLERANCE", default_value_t = DEFAULT_TOLERANCE)]
    pub tolerance: i64,
    #[arg(long, env = "NESTEGG_MAX_ITERATIONS", default_value_t = DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: u32,
    #[arg(
        long,
        env = "NESTEGG_TRIALS_PER_ITERATION",
        default_value_t = DEFAULT_TRIALS_PER_ITERATION
    )]
    pub trials_per_iteration: u32,
    #[arg(long, env = "NESTEGG_FINAL_TRIALS", default_value_t = DEFAULT_FINAL_TRIALS)]
    pub final_trials: u32,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub series: SeriesArgs,
    #[arg(long, env = "NESTEGG_PORT", default_value_t = 8080)]
    pub port: u16,
}

pub async fn run(cli: Cli) -> Result<()> {
    let today = Local::now().date_naive();
    match cli.command {
        Command::Simulate(args) => {
            let (returns, inflation) = args.series.load()?;
            let config = build_config(
                &args.sim,
                SimulationConfig::default(),
                inflation.is_some(),
                today,
            )
            .map_err(anyhow::Error::msg)?;
            let summary = run_simulation(&returns, inflation.as_ref(), &config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", render_simulation(&config, &summary));
            }
        }
        Command::Plan(args) => {
            let (returns, inflation) = args.series.load()?;
            let plan = build_plan(&args.sim, &args.plan, inflation.is_some(), today)
                .map_err(anyhow::Error::msg)?;
            match &args.plan.sweep {
                Some(levels) => {
                    let rows = sweep_contributions(&returns, inflation.as_ref(), &plan, levels)?;
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    } else {
                        println!("{}", render_sweep(&rows));
                    }
                }
                None => {
                    let summary = run_plan(&returns, inflation.as_ref(), &plan)?;
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    } else {
                        println!("{}", render_plan(&plan, &summary));
                    }
                }
            }
        }
        Command::Solve(args) => {
            let (returns, inflation) = args.series.load()?;
            let base = build_config(
                &args.sim,
                SimulationConfig::default(),
                inflation.is_some(),
                today,
            )
            .map_err(anyhow::Error::msg)?;
            let result =
                solve_goal(&returns, inflation.as_ref(), &base, goal_config(&args.goal))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", render_goal(&result));
            }
        }
        Command::Serve(args) => {
            let (returns, inflation) = args.series.load()?;
            info!(
                returns = returns.len(),
                inflation = inflation.as_ref().map(RateSeries::len),
                "loaded history"
            );
            super::run_http_server(args.port, returns, inflation)
                .await
                .context("HTTP server failed")?;
        }
    }
    Ok(())
}

/// Layers the options that were given over `base` and checks them.
pub(crate) fn build_config(
    args: &SimArgs,
    base: SimulationConfig,
    has_inflation: bool,
    today: NaiveDate,
) -> Result<SimulationConfig, String> {
    let mut config = base;
    if let Some(v) = args.trials {
        config.trial_count = v;
    }
    if let Some(v) = args.min_duration {
        config.min_duration = v;
    }
    if let Some(v) = args.max_duration {
        config.max_duration = v;
    }
    if let Some(cutoff) = args.cutoff_date {
        config.mode_duration = days_until_cutoff(today, cutoff);
    } else if let Some(v) = args.mode_duration {
        config.mode_duration = v;
    }
    if let Some(v) = args.start_value {
        config.start_value = v;
    }
    if let Some(v) = args.amount {
        config.amount = v;
    }
    if args.contribute {
        config.flow = CashFlow::Contribute;
    }
    config.apply_inflation_adjustment = has_inflation && !args.flat_amount;
    if let Some(v) = args.ruin_policy {
        config.ruin_policy = v.into();
    }
    if let Some(v) = args.ruin_criterion {
        config.ruin_criterion = v.into();
    }
    if let Some(v) = args.tail_percentile {
        if !(0.0..100.0).contains(&v) {
            return Err("--tail-percentile must be >= 0 and < 100".to_string());
        }
        config.tail_quantile = v / 100.0;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    if config.trial_count == 0 {
        return Err("--trials must be > 0".to_string());
    }
    if config.min_duration == 0 {
        return Err("--min-duration must be > 0".to_string());
    }
    if config.max_duration < config.min_duration {
        return Err("--max-duration must be >= --min-duration".to_string());
    }
    if !(config.min_duration..=config.max_duration).contains(&config.mode_duration) {
        let source = if args.cutoff_date.is_some() {
            "--cutoff-date"
        } else {
            "--mode-duration"
        };
        return Err(format!(
            "{source} gives a most likely duration of {}, outside {}..={}",
            config.mode_duration, config.min_duration, config.max_duration
        ));
    }
    if config.start_value <= 0 {
        return Err("--start-value must be > 0".to_string());
    }
    if config.amount < 0 {
        return Err("--amount must be >= 0".to_string());
    }
    Ok(config)
}

pub(crate) fn build_plan(
    sim: &SimArgs,
    options: &PlanOptions,
    has_inflation: bool,
    today: NaiveDate,
) -> Result<PlanConfig, String> {
    if sim.contribute {
        return Err("--contribute is not valid for plan; use --contribution".to_string());
    }
    let base = PlanConfig::default();
    let mut plan = PlanConfig {
        retirement: build_config(sim, base.retirement.clone(), has_inflation, today)?,
        ..base
    };
    if let Some(v) = options.accumulation_years {
        plan.accumulation_years = v;
    }
    if let Some(v) = options.contribution {
        plan.annual_contribution = v;
    }
    plan.escalate_contribution = options.escalate_contribution;

    if plan.accumulation_years == 0 {
        return Err("--accumulation-years must be > 0".to_string());
    }
    if plan.annual_contribution < 0 {
        return Err("--contribution must be >= 0".to_string());
    }
    if plan.escalate_contribution && !has_inflation {
        return Err("--escalate-contribution requires --inflation".to_string());
    }
    if let Some(levels) = &options.sweep {
        if levels.is_empty() {
            return Err("--sweep needs at least one level".to_string());
        }
        if levels.iter().any(|v| *v < 0) {
            return Err("--sweep levels must be >= 0".to_string());
        }
    }
    Ok(plan)
}

pub(crate) fn goal_config(options: &GoalOptions) -> GoalSolveConfig {
    GoalSolveConfig {
        goal_type: options.goal.into(),
        target_ruin_pct: options.target_ruin,
        search_min: options.search_min,
        search_max: options.search_max,
        tolerance: options.tolerance,
        max_iterations: options.max_iterations,
        trials_per_iteration: options.trials_per_iteration,
        final_trials: options.final_trials,
    }
}
