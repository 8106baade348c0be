use serde::{Deserialize, Serialize};

use super::error::SimError;

/// Whether the periodic amount leaves or enters the account.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CashFlow {
    Withdraw,
    Contribute,
}

/// What happens once a trial's balance reaches zero or below.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuinPolicy {
    /// Stop the trial immediately and report a terminal value of zero.
    StopAndClamp,
    /// Keep compounding the (possibly negative) balance until the window ends.
    ContinueCompounding,
}

/// Which trials count towards the odds of ruin.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuinCriterion {
    /// The balance hit zero or below at some step.
    Depletion,
    /// Depletion, or the trial ended below its starting value.
    Shortfall,
}

/// A historical series of decimal period rates (0.072 == 7.2%).
///
/// Never empty. Indexing wraps around so a short history can feed windows of
/// any length.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSeries {
    values: Vec<f64>,
}

pub type ReturnSeries = RateSeries;
pub type InflationSeries = RateSeries;

impl RateSeries {
    pub fn new(values: Vec<f64>) -> Result<Self, SimError> {
        if values.is_empty() {
            return Err(SimError::Config("series must not be empty".to_string()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(SimError::Config(format!(
                "series value at index {idx} is not finite"
            )));
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value at `index mod len`.
    pub fn at(&self, index: usize) -> f64 {
        self.values[index % self.values.len()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub trial_count: u32,
    pub min_duration: u32,
    pub mode_duration: u32,
    pub max_duration: u32,
    pub start_value: i64,
    /// Periodic withdrawal or contribution in today's currency units.
    pub amount: i64,
    pub flow: CashFlow,
    pub apply_inflation_adjustment: bool,
    pub ruin_policy: RuinPolicy,
    pub ruin_criterion: RuinCriterion,
    pub tail_quantile: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trial_count: 50_000,
            min_duration: 18,
            mode_duration: 25,
            max_duration: 40,
            start_value: 2_000_000,
            amount: 80_000,
            flow: CashFlow::Withdraw,
            apply_inflation_adjustment: true,
            ruin_policy: RuinPolicy::StopAndClamp,
            ruin_criterion: RuinCriterion::Depletion,
            tail_quantile: 0.95,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self, inflation: Option<&InflationSeries>) -> Result<(), SimError> {
        if self.trial_count == 0 {
            return Err(SimError::Config("trial count must be > 0".to_string()));
        }
        if self.min_duration == 0 {
            return Err(SimError::Config("minimum duration must be > 0".to_string()));
        }
        if self.mode_duration < self.min_duration {
            return Err(SimError::Config(
                "most likely duration must be >= minimum duration".to_string(),
            ));
        }
        if self.max_duration < self.mode_duration {
            return Err(SimError::Config(
                "maximum duration must be >= most likely duration".to_string(),
            ));
        }
        if self.start_value <= 0 {
            return Err(SimError::Config("start value must be > 0".to_string()));
        }
        if self.amount < 0 {
            return Err(SimError::Config(
                "amount must be >= 0; use the cash flow direction to withdraw".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.tail_quantile) {
            return Err(SimError::Config(
                "tail quantile must be in [0, 1)".to_string(),
            ));
        }
        if self.apply_inflation_adjustment && self.amount > 0 && inflation.is_none() {
            return Err(SimError::Config(
                "inflation adjustment requires an inflation series".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialOutcome {
    pub start_index: usize,
    pub duration: u32,
    pub start_value: i64,
    pub terminal_value: i64,
    pub ruined: bool,
}

impl TrialOutcome {
    /// Positive when the trial ended below where it started.
    pub fn loss(&self) -> i64 {
        self.start_value - self.terminal_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub total_trials: u32,
    pub ruin_count: u32,
    pub ruin_probability_pct: f64,
    pub min_outcome: i64,
    pub avg_outcome: i64,
    pub max_outcome: i64,
    pub tail_quantile: f64,
    pub tail_loss: i64,
    pub seed: u64,
}

/// Working years of saving followed by a retirement drawdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    pub accumulation_years: u32,
    pub annual_contribution: i64,
    pub escalate_contribution: bool,
    /// `start_value` is the savings balance on day one of the working years.
    pub retirement: SimulationConfig,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            accumulation_years: 25,
            annual_contribution: 12_000,
            escalate_contribution: false,
            retirement: SimulationConfig {
                trial_count: 100_000,
                min_duration: 16,
                mode_duration: 22,
                max_duration: 35,
                start_value: 10_000,
                amount: 45_000,
                ..SimulationConfig::default()
            },
        }
    }
}

impl PlanConfig {
    pub fn validate(&self, inflation: Option<&InflationSeries>) -> Result<(), SimError> {
        if self.accumulation_years == 0 {
            return Err(SimError::Config(
                "accumulation years must be > 0".to_string(),
            ));
        }
        if self.annual_contribution < 0 {
            return Err(SimError::Config(
                "annual contribution must be >= 0".to_string(),
            ));
        }
        if self.escalate_contribution && self.annual_contribution > 0 && inflation.is_none() {
            return Err(SimError::Config(
                "contribution escalation requires an inflation series".to_string(),
            ));
        }
        if self.retirement.flow != CashFlow::Withdraw {
            return Err(SimError::Config(
                "retirement phase must withdraw".to_string(),
            ));
        }
        self.retirement.validate(inflation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub annual_contribution: i64,
    pub min_accumulated: i64,
    pub avg_accumulated: i64,
    pub max_accumulated: i64,
    pub retirement: SimulationSummary,
}
