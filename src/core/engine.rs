use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Triangular};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use tracing::{debug, info};

use super::error::SimError;
use super::types::{
    CashFlow, InflationSeries, PlanConfig, PlanSummary, ReturnSeries, RuinCriterion, RuinPolicy,
    SimulationConfig, SimulationSummary, TrialOutcome,
};

const TRIAL_STREAM: u32 = 0;
const ACCUMULATION_STREAM: u32 = 1;
const RETIREMENT_STREAM: u32 = 2;

// Largest magnitude a balance may reach before the trial is treated as overflowed.
const BALANCE_LIMIT: f64 = i64::MAX as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start_index: usize,
    duration: u32,
}

/// Everything `simulate_window` needs to move a balance through one window.
#[derive(Debug, Clone, Copy)]
struct StepRules {
    start_value: i64,
    amount: i64,
    flow: CashFlow,
    escalate: bool,
    policy: RuinPolicy,
    criterion: RuinCriterion,
}

impl StepRules {
    fn from_config(config: &SimulationConfig) -> Self {
        Self {
            start_value: config.start_value,
            amount: config.amount,
            flow: config.flow,
            escalate: config.apply_inflation_adjustment,
            policy: config.ruin_policy,
            criterion: config.ruin_criterion,
        }
    }
}

#[derive(Debug, Clone)]
enum DurationSampler {
    Fixed(u32),
    Triangular {
        dist: Triangular<f64>,
        min: u32,
        max: u32,
    },
}

impl DurationSampler {
    fn new(min: u32, mode: u32, max: u32) -> Result<Self, SimError> {
        if min == max {
            return Ok(Self::Fixed(min));
        }
        let dist = Triangular::new(min as f64, max as f64, mode as f64)
            .map_err(|e| SimError::Distribution(e.to_string()))?;
        Ok(Self::Triangular { dist, min, max })
    }

    fn from_config(config: &SimulationConfig) -> Result<Self, SimError> {
        Self::new(
            config.min_duration,
            config.mode_duration,
            config.max_duration,
        )
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Triangular { dist, min, max } => (dist.sample(rng) as u32).clamp(*min, *max),
        }
    }
}

/// Runs a single trial: draws a start index and a duration from `rng`, then
/// compounds the configured balance through that window.
pub fn run_trial<R: Rng + ?Sized>(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<TrialOutcome, SimError> {
    config.validate(inflation)?;
    let durations = DurationSampler::from_config(config)?;
    let window = draw_window(returns, &durations, rng);
    simulate_window(returns, inflation, StepRules::from_config(config), window, 0)
}

/// Runs `config.trial_count` independent trials and aggregates them.
///
/// Trial `i` draws from its own generator seeded by `derive_seed(seed, _, i)`,
/// so the summary depends only on the inputs and the base seed, never on how
/// rayon schedules the work.
pub fn run_simulation(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    config: &SimulationConfig,
) -> Result<SimulationSummary, SimError> {
    config.validate(inflation)?;
    let seed = resolve_seed(config.seed);
    debug!(
        trials = config.trial_count,
        min = config.min_duration,
        mode = config.mode_duration,
        max = config.max_duration,
        start_value = config.start_value,
        amount = config.amount,
        seed,
        "running ruin simulation"
    );

    let started = Instant::now();
    let outcomes = simulate_outcomes(returns, inflation, config, seed)?;
    let summary = summarize(&outcomes, config.tail_quantile, seed);

    info!(
        trials = summary.total_trials,
        ruin_pct = summary.ruin_probability_pct,
        seed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "simulation finished"
    );
    Ok(summary)
}

pub(crate) fn simulate_outcomes(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    config: &SimulationConfig,
    seed: u64,
) -> Result<Vec<TrialOutcome>, SimError> {
    let durations = DurationSampler::from_config(config)?;
    let rules = StepRules::from_config(config);

    (0..config.trial_count)
        .into_par_iter()
        .map(|trial| {
            let mut rng = trial_rng(seed, TRIAL_STREAM, trial);
            let window = draw_window(returns, &durations, &mut rng);
            simulate_window(returns, inflation, rules, window, trial)
        })
        .collect()
}

/// Aggregates trial outcomes. Losses are measured against each trial's own
/// starting value; the tail loss is the plain order statistic at rank
/// `floor(n * tail_quantile)` of the ascending losses.
pub fn summarize(outcomes: &[TrialOutcome], tail_quantile: f64, seed: u64) -> SimulationSummary {
    if outcomes.is_empty() {
        return SimulationSummary {
            total_trials: 0,
            ruin_count: 0,
            ruin_probability_pct: 0.0,
            min_outcome: 0,
            avg_outcome: 0,
            max_outcome: 0,
            tail_quantile,
            tail_loss: 0,
            seed,
        };
    }

    let total = outcomes.len();
    let ruin_count = outcomes.iter().filter(|o| o.ruined).count();
    let min_outcome = outcomes.iter().map(|o| o.terminal_value).min().unwrap_or(0);
    let max_outcome = outcomes.iter().map(|o| o.terminal_value).max().unwrap_or(0);
    let sum: i128 = outcomes.iter().map(|o| o.terminal_value as i128).sum();
    let avg_outcome = (sum / total as i128) as i64;

    let mut losses: Vec<i64> = outcomes.iter().map(TrialOutcome::loss).collect();
    losses.sort_unstable();
    let rank = ((total as f64 * tail_quantile).floor() as usize).min(total - 1);

    SimulationSummary {
        total_trials: total as u32,
        ruin_count: ruin_count as u32,
        ruin_probability_pct: round_to_tenth(100.0 * ruin_count as f64 / total as f64),
        min_outcome,
        avg_outcome,
        max_outcome,
        tail_quantile,
        tail_loss: losses[rank],
        seed,
    }
}

#[derive(Debug, Clone, Copy)]
struct PlanOutcome {
    accumulated: i64,
    retirement: TrialOutcome,
}

/// Simulates saving for `accumulation_years` and then drawing down in
/// retirement. The two phases sample independent historical windows.
pub fn run_plan(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    plan: &PlanConfig,
) -> Result<PlanSummary, SimError> {
    plan.validate(inflation)?;
    let seed = resolve_seed(plan.retirement.seed);
    run_plan_with_seed(returns, inflation, plan, seed)
}

/// Evaluates the same plan at each contribution level. Every level reuses one
/// base seed, so rows differ only by the contribution.
pub fn sweep_contributions(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    plan: &PlanConfig,
    contributions: &[i64],
) -> Result<Vec<PlanSummary>, SimError> {
    if contributions.is_empty() {
        return Err(SimError::Config(
            "at least one contribution level is required".to_string(),
        ));
    }
    let seed = resolve_seed(plan.retirement.seed);
    contributions
        .iter()
        .map(|&annual_contribution| {
            let level = PlanConfig {
                annual_contribution,
                ..plan.clone()
            };
            level.validate(inflation)?;
            run_plan_with_seed(returns, inflation, &level, seed)
        })
        .collect()
}

fn run_plan_with_seed(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    plan: &PlanConfig,
    seed: u64,
) -> Result<PlanSummary, SimError> {
    let retirement = &plan.retirement;
    let durations = DurationSampler::from_config(retirement)?;

    let started = Instant::now();
    let outcomes = (0..retirement.trial_count)
        .into_par_iter()
        .map(|trial| run_plan_trial(returns, inflation, plan, &durations, seed, trial))
        .collect::<Result<Vec<_>, _>>()?;

    let retirement_outcomes: Vec<TrialOutcome> = outcomes.iter().map(|o| o.retirement).collect();
    let accumulated = outcomes.iter().map(|o| o.accumulated);
    let sum: i128 = accumulated.clone().map(i128::from).sum();

    let summary = PlanSummary {
        annual_contribution: plan.annual_contribution,
        min_accumulated: accumulated.clone().min().unwrap_or(0),
        avg_accumulated: (sum / outcomes.len().max(1) as i128) as i64,
        max_accumulated: accumulated.max().unwrap_or(0),
        retirement: summarize(&retirement_outcomes, retirement.tail_quantile, seed),
    };
    info!(
        contribution = plan.annual_contribution,
        ruin_pct = summary.retirement.ruin_probability_pct,
        seed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "plan simulation finished"
    );
    Ok(summary)
}

/// One saving phase over a fixed `accumulation_years` window, then one
/// drawdown from the accumulated balance at an independently drawn window.
fn run_plan_trial(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    plan: &PlanConfig,
    durations: &DurationSampler,
    seed: u64,
    trial: u32,
) -> Result<PlanOutcome, SimError> {
    let saving_rules = StepRules {
        start_value: plan.retirement.start_value,
        amount: plan.annual_contribution,
        flow: CashFlow::Contribute,
        escalate: plan.escalate_contribution,
        policy: RuinPolicy::ContinueCompounding,
        criterion: RuinCriterion::Depletion,
    };
    let mut rng = trial_rng(seed, ACCUMULATION_STREAM, trial);
    let window = Window {
        start_index: rng.gen_range(0..returns.len()),
        duration: plan.accumulation_years,
    };
    let accumulated =
        simulate_window(returns, inflation, saving_rules, window, trial)?.terminal_value;

    let mut rng = trial_rng(seed, RETIREMENT_STREAM, trial);
    let window = draw_window(returns, durations, &mut rng);
    let drawdown_rules = StepRules {
        start_value: accumulated,
        ..StepRules::from_config(&plan.retirement)
    };
    let retirement = simulate_window(returns, inflation, drawdown_rules, window, trial)?;
    Ok(PlanOutcome {
        accumulated,
        retirement,
    })
}

fn draw_window<R: Rng + ?Sized>(
    returns: &ReturnSeries,
    durations: &DurationSampler,
    rng: &mut R,
) -> Window {
    let start_index = rng.gen_range(0..returns.len());
    let duration = durations.sample(rng);
    Window {
        start_index,
        duration,
    }
}

fn simulate_window(
    returns: &ReturnSeries,
    inflation: Option<&InflationSeries>,
    rules: StepRules,
    window: Window,
    trial: u32,
) -> Result<TrialOutcome, SimError> {
    let overflow = || SimError::Overflow { trial };
    let mut balance = rules.start_value;
    let mut amount = rules.amount;
    let mut depleted = false;

    for step in 0..window.duration as usize {
        let index = window.start_index + step;

        if rules.amount != 0 {
            if step > 0 && rules.escalate {
                let inflation = inflation.ok_or_else(|| {
                    SimError::Config(
                        "inflation adjustment requires an inflation series".to_string(),
                    )
                })?;
                amount = truncate(amount as f64 * (1.0 + inflation.at(index)))
                    .ok_or_else(overflow)?;
            }
            balance = match rules.flow {
                CashFlow::Withdraw => balance.checked_sub(amount),
                CashFlow::Contribute => balance.checked_add(amount),
            }
            .ok_or_else(overflow)?;
        }

        balance = truncate(balance as f64 * (1.0 + returns.at(index))).ok_or_else(overflow)?;

        if balance <= 0 {
            depleted = true;
            if rules.policy == RuinPolicy::StopAndClamp {
                break;
            }
        }
    }

    let ruined = match rules.criterion {
        RuinCriterion::Depletion => depleted,
        RuinCriterion::Shortfall => depleted || balance < rules.start_value,
    };
    Ok(TrialOutcome {
        start_index: window.start_index,
        duration: window.duration,
        start_value: rules.start_value,
        terminal_value: if ruined { balance.max(0) } else { balance },
        ruined,
    })
}

/// Truncates toward zero into whole currency units.
fn truncate(value: f64) -> Option<i64> {
    if !value.is_finite() || value.abs() >= BALANCE_LIMIT {
        return None;
    }
    Some(value.trunc() as i64)
}

/// Half-way cases go to the even tenth, so 0.25% reports as 0.2%.
fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

pub(crate) fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(rand::random)
}

fn trial_rng(base_seed: u64, stream: u32, trial: u32) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(derive_seed(base_seed, stream, trial))
}

fn derive_seed(base_seed: u64, stream: u32, trial: u32) -> u64 {
    let mixed = base_seed ^ ((stream as u64) << 32) ^ trial as u64;
    splitmix64(mixed)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    fn series(values: &[f64]) -> ReturnSeries {
        ReturnSeries::new(values.to_vec()).expect("valid series")
    }

    fn rules(start_value: i64) -> StepRules {
        StepRules {
            start_value,
            amount: 0,
            flow: CashFlow::Withdraw,
            escalate: false,
            policy: RuinPolicy::StopAndClamp,
            criterion: RuinCriterion::Depletion,
        }
    }

    fn window(start_index: usize, duration: u32) -> Window {
        Window {
            start_index,
            duration,
        }
    }

    fn outcome(start_value: i64, terminal_value: i64, ruined: bool) -> TrialOutcome {
        TrialOutcome {
            start_index: 0,
            duration: 1,
            start_value,
            terminal_value,
            ruined,
        }
    }

    fn sample_config() -> SimulationConfig {
        SimulationConfig {
            trial_count: 400,
            min_duration: 5,
            mode_duration: 12,
            max_duration: 30,
            start_value: 1_000_000,
            amount: 60_000,
            flow: CashFlow::Withdraw,
            apply_inflation_adjustment: true,
            ruin_policy: RuinPolicy::StopAndClamp,
            ruin_criterion: RuinCriterion::Depletion,
            tail_quantile: 0.95,
            seed: Some(42),
        }
    }

    fn history() -> (ReturnSeries, InflationSeries) {
        (
            series(&[0.12, -0.08, 0.21, 0.05, -0.31, 0.26, 0.09, 0.15, -0.02, 0.07]),
            series(&[0.03, 0.02, 0.05, 0.01, 0.04]),
        )
    }

    #[test]
    fn compounding_truncates_to_whole_units_each_step() {
        let returns = series(&[0.10, -0.10, 0.05, 0.05]);
        let out = simulate_window(&returns, None, rules(1_000), window(0, 4), 0)
            .expect("no overflow");
        // 1000 -> 1100 -> 990 -> 1039 -> 1090
        assert_eq!(out.terminal_value, 1_090);
        assert!(!out.ruined);
    }

    #[test]
    fn halving_twice_is_not_ruin() {
        let returns = series(&[-0.5, -0.5]);
        let out = simulate_window(&returns, None, rules(100), window(0, 2), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 25);
        assert!(!out.ruined);
    }

    #[test]
    fn total_loss_is_ruin_with_zero_terminal_value() {
        let returns = series(&[-1.0]);
        let out = simulate_window(&returns, None, rules(100), window(0, 1), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 0);
        assert!(out.ruined);
    }

    #[test]
    fn window_wraps_around_the_end_of_history() {
        let returns = series(&[0.5, 0.0, -0.5]);
        // indices 2, 0, 1, 2
        let out = simulate_window(&returns, None, rules(1_000), window(2, 4), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 375);
    }

    #[test]
    fn inflation_escalates_withdrawals_from_the_second_step() {
        let returns = series(&[0.0]);
        let inflation = series(&[0.10]);
        let escalated = StepRules {
            amount: 100,
            escalate: true,
            ..rules(1_000)
        };
        let out = simulate_window(&returns, Some(&inflation), escalated, window(0, 3), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 1_000 - 100 - 110 - 121);

        let flat = StepRules {
            escalate: false,
            ..escalated
        };
        let out = simulate_window(&returns, Some(&inflation), flat, window(0, 3), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 700);
    }

    #[test]
    fn escalation_without_inflation_series_is_a_config_error() {
        let escalated = StepRules {
            amount: 100,
            escalate: true,
            ..rules(1_000)
        };
        let err = simulate_window(&series(&[0.0]), None, escalated, window(0, 3), 0)
            .expect_err("must not silently skip escalation");
        assert!(matches!(err, SimError::Config(_)));

        // a single step never escalates, so no series is needed
        let out = simulate_window(&series(&[0.0]), None, escalated, window(0, 1), 0)
            .expect("one step");
        assert_eq!(out.terminal_value, 900);
    }

    #[test]
    fn inflation_index_wraps_independently_of_returns() {
        let returns = series(&[0.0, 0.0, 0.0, 0.0]);
        let inflation = series(&[0.0, 1.0]);
        let escalated = StepRules {
            amount: 10,
            escalate: true,
            ..rules(1_000)
        };
        // amounts: 10, 10*(1+inflation[2 % 2 = 0])=10, 10*(1+inflation[1])=20
        let out = simulate_window(&returns, Some(&inflation), escalated, window(1, 3), 0)
            .expect("no overflow");
        assert_eq!(out.terminal_value, 1_000 - 10 - 10 - 20);
    }

    #[test]
    fn contributions_add_before_the_return_is_applied() {
        let returns = series(&[0.10]);
        let saving = StepRules {
            amount: 100,
            flow: CashFlow::Contribute,
            ..rules(1_000)
        };
        let out = simulate_window(&returns, None, saving, window(0, 2), 0).expect("no overflow");
        // (1000 + 100) * 1.1 = 1210; (1210 + 100) * 1.1 = 1441
        assert_eq!(out.terminal_value, 1_441);
    }

    #[test]
    fn stop_policy_clamps_while_continue_policy_can_recover() {
        let returns = series(&[0.0, -2.0]);
        let stop = StepRules {
            amount: 150,
            ..rules(100)
        };
        let out = simulate_window(&returns, None, stop, window(0, 2), 0).expect("no overflow");
        assert!(out.ruined);
        assert_eq!(out.terminal_value, 0);

        let cont = StepRules {
            policy: RuinPolicy::ContinueCompounding,
            ..stop
        };
        // -50 after step one, then (-50 - 150) * (1 - 2) = 200
        let out = simulate_window(&returns, None, cont, window(0, 2), 0).expect("no overflow");
        assert!(out.ruined);
        assert_eq!(out.terminal_value, 200);
    }

    #[test]
    fn continue_policy_never_reports_a_negative_terminal_value() {
        let returns = series(&[0.05]);
        let cont = StepRules {
            amount: 600,
            policy: RuinPolicy::ContinueCompounding,
            ..rules(1_000)
        };
        let out = simulate_window(&returns, None, cont, window(0, 4), 0).expect("no overflow");
        assert!(out.ruined);
        assert_eq!(out.terminal_value, 0);
    }

    #[test]
    fn shortfall_criterion_counts_ending_below_start() {
        let returns = series(&[-0.1]);
        let depletion = simulate_window(&returns, None, rules(1_000), window(0, 1), 0)
            .expect("no overflow");
        assert!(!depletion.ruined);

        let shortfall = StepRules {
            criterion: RuinCriterion::Shortfall,
            ..rules(1_000)
        };
        let out = simulate_window(&returns, None, shortfall, window(0, 1), 0)
            .expect("no overflow");
        assert!(out.ruined);
        assert_eq!(out.terminal_value, 900);
    }

    #[test]
    fn overflowing_balance_is_an_error() {
        let returns = series(&[1e300]);
        let err = simulate_window(&returns, None, rules(1_000), window(0, 1), 7)
            .expect_err("must overflow");
        assert_eq!(err, SimError::Overflow { trial: 7 });
    }

    #[test]
    fn overflow_in_any_trial_aborts_the_run() {
        let returns = series(&[1e300]);
        let config = SimulationConfig {
            amount: 0,
            apply_inflation_adjustment: false,
            ..sample_config()
        };
        let err = run_simulation(&returns, None, &config).expect_err("must abort");
        assert!(matches!(err, SimError::Overflow { .. }));
    }

    #[test]
    fn tail_loss_uses_the_plain_order_statistic() {
        let outcomes: Vec<TrialOutcome> = [0, 0, 50, 100, 150]
            .into_iter()
            .map(|v| outcome(100, v, v == 0))
            .collect();
        let summary = summarize(&outcomes, 0.95, 1);
        // losses sorted: [-50, 0, 50, 100, 100], rank floor(5 * 0.95) = 4
        assert_eq!(summary.tail_loss, 100);
        assert_eq!(summary.ruin_count, 2);
        assert_eq!(summary.ruin_probability_pct, 40.0);
        assert_eq!(summary.min_outcome, 0);
        assert_eq!(summary.avg_outcome, 60);
        assert_eq!(summary.max_outcome, 150);
    }

    #[test]
    fn summary_rounds_odds_to_one_decimal_and_floors_average() {
        let mut outcomes = vec![outcome(10, 5, false); 2];
        outcomes.push(outcome(10, 0, true));
        let summary = summarize(&outcomes, 0.5, 1);
        assert_eq!(summary.ruin_probability_pct, 33.3);
        assert_eq!(summary.avg_outcome, 3);
        // losses sorted [5, 5, 10], rank floor(3 * 0.5) = 1
        assert_eq!(summary.tail_loss, 5);
    }

    #[test]
    fn summary_rounds_half_tenths_to_even() {
        let mut outcomes = vec![outcome(10, 10, false); 399];
        outcomes.push(outcome(10, 0, true));
        let summary = summarize(&outcomes, 0.95, 1);
        assert_eq!(summary.ruin_count, 1);
        assert_eq!(summary.ruin_probability_pct, 0.2);

        let mut outcomes = vec![outcome(10, 10, false); 397];
        outcomes.extend(vec![outcome(10, 0, true); 3]);
        assert_eq!(summarize(&outcomes, 0.95, 1).ruin_probability_pct, 0.8);
    }

    #[test]
    fn summarize_empty_is_all_zero() {
        let summary = summarize(&[], 0.95, 9);
        assert_eq!(summary.total_trials, 0);
        assert_eq!(summary.tail_loss, 0);
        assert_eq!(summary.seed, 9);
    }

    #[test]
    fn fixed_duration_skips_the_distribution() {
        let sampler = DurationSampler::new(4, 4, 4).expect("valid");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        assert_eq!(sampler.sample(&mut rng), 4);
    }

    #[test]
    fn run_trial_is_reproducible_from_the_generator_seed() {
        let (returns, inflation) = history();
        let config = sample_config();
        let mut a = Xoshiro256PlusPlus::seed_from_u64(99);
        let mut b = Xoshiro256PlusPlus::seed_from_u64(99);
        let left = run_trial(&returns, Some(&inflation), &config, &mut a).expect("valid");
        let right = run_trial(&returns, Some(&inflation), &config, &mut b).expect("valid");
        assert_eq!(left, right);
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let (returns, inflation) = history();
        let config = sample_config();
        let a = run_simulation(&returns, Some(&inflation), &config).expect("valid");
        let b = run_simulation(&returns, Some(&inflation), &config).expect("valid");
        assert_eq!(a, b);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn parallel_outcomes_match_serial_trials() {
        let (returns, inflation) = history();
        let config = sample_config();
        let parallel =
            simulate_outcomes(&returns, Some(&inflation), &config, 42).expect("valid");

        let durations = DurationSampler::from_config(&config).expect("valid");
        let serial: Vec<TrialOutcome> = (0..config.trial_count)
            .map(|trial| {
                let mut rng = trial_rng(42, TRIAL_STREAM, trial);
                let window = draw_window(&returns, &durations, &mut rng);
                simulate_window(
                    &returns,
                    Some(&inflation),
                    StepRules::from_config(&config),
                    window,
                    trial,
                )
                .expect("no overflow")
            })
            .collect();
        assert_eq!(parallel, serial);
    }

    #[test]
    fn invalid_configs_fail_before_any_trial() {
        let (returns, inflation) = history();
        let cases: Vec<(SimulationConfig, &str)> = vec![
            (
                SimulationConfig {
                    trial_count: 0,
                    ..sample_config()
                },
                "trial count",
            ),
            (
                SimulationConfig {
                    min_duration: 0,
                    ..sample_config()
                },
                "minimum duration",
            ),
            (
                SimulationConfig {
                    mode_duration: 4,
                    ..sample_config()
                },
                "most likely",
            ),
            (
                SimulationConfig {
                    max_duration: 10,
                    ..sample_config()
                },
                "maximum duration",
            ),
            (
                SimulationConfig {
                    start_value: 0,
                    ..sample_config()
                },
                "start value",
            ),
            (
                SimulationConfig {
                    tail_quantile: 1.0,
                    ..sample_config()
                },
                "tail quantile",
            ),
        ];
        for (config, needle) in cases {
            let err = run_simulation(&returns, Some(&inflation), &config)
                .expect_err("must reject config");
            assert!(err.to_string().contains(needle), "{err} should mention {needle}");
        }

        let err = run_simulation(&returns, None, &sample_config()).expect_err("needs inflation");
        assert!(err.to_string().contains("inflation"));
    }

    #[test]
    fn empty_series_is_rejected() {
        assert!(ReturnSeries::new(Vec::new()).is_err());
        assert!(ReturnSeries::new(vec![0.1, f64::NAN]).is_err());
    }

    #[test]
    fn derive_seed_changes_per_stream_and_trial() {
        let base = derive_seed(42, 0, 0);
        assert_ne!(base, derive_seed(42, 0, 1));
        assert_ne!(base, derive_seed(42, 1, 0));
        assert_ne!(base, derive_seed(43, 0, 0));
    }

    fn plan_config() -> PlanConfig {
        PlanConfig {
            accumulation_years: 5,
            annual_contribution: 1_000,
            escalate_contribution: false,
            retirement: SimulationConfig {
                trial_count: 50,
                min_duration: 10,
                mode_duration: 10,
                max_duration: 10,
                start_value: 10_000,
                amount: 1_000,
                apply_inflation_adjustment: false,
                seed: Some(3),
                ..sample_config()
            },
        }
    }

    #[test]
    fn plan_accumulates_then_draws_down() {
        let returns = series(&[0.0]);
        let summary = run_plan(&returns, None, &plan_config()).expect("valid plan");
        assert_eq!(summary.min_accumulated, 15_000);
        assert_eq!(summary.max_accumulated, 15_000);
        assert_eq!(summary.retirement.min_outcome, 5_000);
        assert_eq!(summary.retirement.ruin_count, 0);
        // losses are measured against the accumulated balance
        assert_eq!(summary.retirement.tail_loss, 10_000);
    }

    #[test]
    fn plan_with_too_little_saved_is_ruined() {
        let returns = series(&[0.0]);
        let mut plan = plan_config();
        plan.annual_contribution = 0;
        let summary = run_plan(&returns, None, &plan).expect("valid plan");
        assert_eq!(summary.avg_accumulated, 10_000);
        assert_eq!(summary.retirement.ruin_count, 50);
        assert_eq!(summary.retirement.ruin_probability_pct, 100.0);
        assert_eq!(summary.retirement.max_outcome, 0);
    }

    #[test]
    fn sweep_returns_one_row_per_level_in_order() {
        let (returns, inflation) = history();
        let mut plan = plan_config();
        plan.retirement.min_duration = 8;
        plan.retirement.max_duration = 20;
        let levels = [0, 1_000, 5_000];
        let rows =
            sweep_contributions(&returns, Some(&inflation), &plan, &levels).expect("valid sweep");
        assert_eq!(rows.len(), 3);
        for (row, level) in rows.iter().zip(levels) {
            assert_eq!(row.annual_contribution, level);
        }
        for pair in rows.windows(2) {
            assert!(pair[1].avg_accumulated >= pair[0].avg_accumulated);
            assert!(pair[1].retirement.ruin_count <= pair[0].retirement.ruin_count);
        }
    }

    #[test]
    fn sweep_rejects_an_empty_ladder() {
        let (returns, _) = history();
        assert!(sweep_contributions(&returns, None, &plan_config(), &[]).is_err());
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_summary_bounds_hold(
            seed in any::<u64>(),
            trials in 1u32..200,
            min in 1u32..10,
            mode_extra in 0u32..10,
            max_extra in 0u32..10,
            amount in 0i64..150_000,
        ) {
            let (returns, inflation) = history();
            let config = SimulationConfig {
                trial_count: trials,
                min_duration: min,
                mode_duration: min + mode_extra,
                max_duration: min + mode_extra + max_extra,
                amount,
                seed: Some(seed),
                ..sample_config()
            };
            let outcomes = simulate_outcomes(&returns, Some(&inflation), &config, seed)
                .expect("valid run");
            for o in &outcomes {
                prop_assert!(o.duration >= config.min_duration);
                prop_assert!(o.duration <= config.max_duration);
                prop_assert!(o.start_index < returns.len());
                prop_assert!(o.terminal_value >= 0);
            }
            let summary = summarize(&outcomes, config.tail_quantile, seed);
            prop_assert_eq!(summary.total_trials, trials);
            prop_assert!(summary.ruin_count <= summary.total_trials);
            prop_assert!((0.0..=100.0).contains(&summary.ruin_probability_pct));
            prop_assert!(summary.min_outcome <= summary.avg_outcome);
            prop_assert!(summary.avg_outcome <= summary.max_outcome);
        }

        #[test]
        fn prop_window_values_wrap_modulo_length(
            len in 1usize..20,
            k in 0usize..200,
        ) {
            let values: Vec<f64> = (0..len).map(|i| i as f64 / 100.0).collect();
            let returns = series(&values);
            prop_assert_eq!(returns.at(len + k), values[k % len]);
        }

        #[test]
        fn prop_larger_start_never_ends_lower_without_withdrawals(
            start in 1i64..1_000_000,
            delta in 0i64..1_000_000,
            contribution in 0i64..10_000,
            start_index in 0usize..10,
            duration in 1u32..40,
        ) {
            let (returns, _) = history();
            let base = StepRules {
                amount: contribution,
                flow: CashFlow::Contribute,
                ..rules(start)
            };
            let larger = StepRules { start_value: start + delta, ..base };
            let w = window(start_index, duration);
            let lo = simulate_window(&returns, None, base, w, 0).expect("no overflow");
            let hi = simulate_window(&returns, None, larger, w, 0).expect("no overflow");
            prop_assert!(hi.terminal_value >= lo.terminal_value);
        }
    }
}
