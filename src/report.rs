//! Plain-text rendering of simulation results for the terminal.

use crate::core::{
    CashFlow, GoalSolveResult, GoalType, PlanConfig, PlanSummary, SimulationConfig,
    SimulationSummary,
};

pub fn render_simulation(config: &SimulationConfig, summary: &SimulationSummary) -> String {
    let flow_label = match config.flow {
        CashFlow::Withdraw => "Periodic withdrawal",
        CashFlow::Contribute => "Periodic contribution",
    };
    let mut lines = vec![
        format!("Start value: {}", format_currency(config.start_value)),
        format!("{flow_label}: {}", format_currency(config.amount)),
        format!(
            "Duration (min-ml-max): {}-{}-{}",
            config.min_duration, config.mode_duration, config.max_duration
        ),
        format!("Number of runs: {}", group_thousands(u64::from(summary.total_trials))),
        String::new(),
    ];
    lines.extend(summary_lines(summary));
    lines.push(format!("Seed: {}", summary.seed));
    lines.join("\n")
}

fn summary_lines(summary: &SimulationSummary) -> Vec<String> {
    vec![
        format!("Odds of ruin: {:.1}%", summary.ruin_probability_pct),
        format!("Minimum outcome: {}", format_currency(summary.min_outcome)),
        format!("Average outcome: {}", format_currency(summary.avg_outcome)),
        format!("Maximum outcome: {}", format_currency(summary.max_outcome)),
        format!(
            "Tail loss (P{}): {}",
            quantile_label(summary.tail_quantile),
            format_currency(summary.tail_loss)
        ),
    ]
}

pub fn render_plan(plan: &PlanConfig, summary: &PlanSummary) -> String {
    let retirement = &plan.retirement;
    let mut lines = vec![
        format!("Initial savings: {}", format_currency(retirement.start_value)),
        format!(
            "Annual contribution: {} for {} years",
            format_currency(summary.annual_contribution),
            plan.accumulation_years
        ),
        format!(
            "Accumulated (min-avg-max): {} / {} / {}",
            format_currency(summary.min_accumulated),
            format_currency(summary.avg_accumulated),
            format_currency(summary.max_accumulated)
        ),
        format!("Annual withdrawal: {}", format_currency(retirement.amount)),
        format!(
            "Years in retirement (min-ml-max): {}-{}-{}",
            retirement.min_duration, retirement.mode_duration, retirement.max_duration
        ),
        String::new(),
    ];
    lines.extend(summary_lines(&summary.retirement));
    lines.push(format!("Seed: {}", summary.retirement.seed));
    lines.join("\n")
}

pub fn render_sweep(rows: &[PlanSummary]) -> String {
    let header = format!(
        "{:>14} {:>16} {:>8} {:>14} {:>14} {:>14}",
        "Contribution", "Avg savings", "Odds", "Min", "Avg", "Max"
    );
    let mut lines = vec![header];
    for row in rows {
        lines.push(format!(
            "{:>14} {:>16} {:>7.1}% {:>14} {:>14} {:>14}",
            format_currency(row.annual_contribution),
            format_currency(row.avg_accumulated),
            row.retirement.ruin_probability_pct,
            format_currency(row.retirement.min_outcome),
            format_currency(row.retirement.avg_outcome),
            format_currency(row.retirement.max_outcome),
        ));
    }
    lines.join("\n")
}

pub fn render_goal(result: &GoalSolveResult) -> String {
    let goal = match result.goal_type {
        GoalType::MaxWithdrawal => "Maximum withdrawal",
        GoalType::MinStartValue => "Minimum start value",
    };
    let mut lines = vec![
        format!("Goal: {goal} at <= {:.1}% odds of ruin", result.target_ruin_pct),
        format!(
            "Search range: {} - {}",
            format_currency(result.search_min),
            format_currency(result.search_max)
        ),
    ];
    match result.solved_value {
        Some(value) => {
            lines.push(format!("Solved value: {}", format_currency(value)));
            if let (Some(pct), Some(ci)) =
                (result.achieved_ruin_pct, result.achieved_ruin_ci_half_width_pct)
            {
                lines.push(format!("Achieved odds of ruin: {pct:.2}% (+/- {ci:.2}%)"));
            }
        }
        None => lines.push("Solved value: none".to_string()),
    }
    lines.push(format!("Iterations: {}", result.iterations.len()));
    lines.push(result.message.clone());
    lines.join("\n")
}

fn quantile_label(q: f64) -> String {
    let pct = q * 100.0;
    if (pct - pct.round()).abs() < 1e-9 {
        format!("{}", pct.round() as i64)
    } else {
        format!("{pct:.1}")
    }
}

/// `$1,234,567`, with a leading minus for negative amounts.
pub fn format_currency(value: i64) -> String {
    if value < 0 {
        format!("-${}", group_thousands(value.unsigned_abs()))
    } else {
        format!("${}", group_thousands(value.unsigned_abs()))
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
