//! The reward function: a pure map from session context and outcome to a
//! scalar reward plus its per-component breakdown.
//!
//! The breakdown is preserved verbatim in every experience record so
//! later analysis can re-weight components without replaying sessions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::session::Phase;

/// Final reward is clamped into this envelope; the breakdown is not.
pub const REWARD_MIN: f64 = -200.0;
pub const REWARD_MAX: f64 = 200.0;

/// What the planner believed going in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardContext {
    pub estimated_minutes: f64,
    /// Fewest adapter invocations a clean run would need
    pub minimum_resources: u64,
}

/// What actually happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardOutcome {
    pub final_phase: Phase,
    pub actual_minutes: f64,
    /// Total adapter invocations
    pub resources_used: u64,
    pub error_count: u64,
    /// Files the user touched after generation
    pub post_generation_modifications: u64,
    pub safety_violations: u64,
    /// None when tests were not run
    pub tests_passed: Option<bool>,
    pub total_cost_usd: f64,
    pub cheap_adapter_successes: u64,
    pub expensive_adapter_usages: u64,
    pub fallback_rotations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardResult {
    pub reward: f64,
    pub breakdown: BTreeMap<String, f64>,
}

/// Compute the reward. Deterministic: identical inputs always produce
/// identical output.
pub fn compute_reward(context: &RewardContext, outcome: &RewardOutcome) -> RewardResult {
    let mut breakdown = BTreeMap::new();
    let succeeded = outcome.final_phase == Phase::Completed;

    breakdown.insert(
        "success".to_string(),
        if succeeded { 100.0 } else { -100.0 },
    );

    let time_efficiency = if succeeded {
        (context.estimated_minutes / outcome.actual_minutes.max(1.0)).min(2.0) * 20.0
    } else {
        0.0
    };
    breakdown.insert("timeEfficiency".to_string(), time_efficiency);

    let resource_efficiency = if outcome.resources_used <= context.minimum_resources {
        10.0
    } else {
        -5.0 * (outcome.resources_used - context.minimum_resources) as f64
    };
    breakdown.insert("resourceEfficiency".to_string(), resource_efficiency);

    let quality = if outcome.error_count == 0 {
        15.0
    } else {
        -10.0 * outcome.error_count as f64
    };
    breakdown.insert("quality".to_string(), quality);

    let user_satisfaction = if outcome.post_generation_modifications == 0 {
        10.0
    } else {
        -5.0 * outcome.post_generation_modifications as f64
    };
    breakdown.insert("userSatisfaction".to_string(), user_satisfaction);

    let safety = if outcome.safety_violations > 0 { -50.0 } else { 10.0 };
    breakdown.insert("safety".to_string(), safety);

    let tests = if outcome.tests_passed == Some(true) { 5.0 } else { 0.0 };
    breakdown.insert("tests".to_string(), tests);

    let cost_efficiency = if outcome.total_cost_usd < 0.10 {
        50.0
    } else if outcome.total_cost_usd >= 0.50 {
        -20.0
    } else {
        0.0
    };
    breakdown.insert("costEfficiency".to_string(), cost_efficiency);

    breakdown.insert(
        "cheapAdapterSuccesses".to_string(),
        10.0 * outcome.cheap_adapter_successes as f64,
    );

    breakdown.insert(
        "expensiveAdapterOveruse".to_string(),
        -5.0 * (outcome.expensive_adapter_usages.saturating_sub(3)) as f64,
    );

    breakdown.insert(
        "fallbackRotations".to_string(),
        -10.0 * outcome.fallback_rotations as f64,
    );

    let total: f64 = breakdown.values().sum();
    RewardResult {
        reward: total.clamp(REWARD_MIN, REWARD_MAX),
        breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RewardContext {
        RewardContext {
            estimated_minutes: 10.0,
            minimum_resources: 3,
        }
    }

    fn clean_outcome() -> RewardOutcome {
        RewardOutcome {
            final_phase: Phase::Completed,
            actual_minutes: 10.0,
            resources_used: 3,
            error_count: 0,
            post_generation_modifications: 0,
            safety_violations: 0,
            tests_passed: Some(true),
            total_cost_usd: 0.05,
            cheap_adapter_successes: 2,
            expensive_adapter_usages: 1,
            fallback_rotations: 0,
        }
    }

    #[test]
    fn clean_run_scores_every_positive_component() {
        let result = compute_reward(&context(), &clean_outcome());
        assert_eq!(result.breakdown["success"], 100.0);
        assert_eq!(result.breakdown["timeEfficiency"], 20.0);
        assert_eq!(result.breakdown["resourceEfficiency"], 10.0);
        assert_eq!(result.breakdown["quality"], 15.0);
        assert_eq!(result.breakdown["userSatisfaction"], 10.0);
        assert_eq!(result.breakdown["safety"], 10.0);
        assert_eq!(result.breakdown["tests"], 5.0);
        assert_eq!(result.breakdown["costEfficiency"], 50.0);
        assert_eq!(result.breakdown["cheapAdapterSuccesses"], 20.0);
        assert_eq!(result.breakdown["expensiveAdapterOveruse"], 0.0);
        assert_eq!(result.breakdown["fallbackRotations"], 0.0);
        // sum is 240, clamped to the envelope
        assert_eq!(result.reward, REWARD_MAX);
    }

    #[test]
    fn failure_zeroes_time_efficiency() {
        let mut outcome = clean_outcome();
        outcome.final_phase = Phase::MaxIterations;
        outcome.actual_minutes = 1.0;
        let result = compute_reward(&context(), &outcome);
        assert_eq!(result.breakdown["success"], -100.0);
        assert_eq!(result.breakdown["timeEfficiency"], 0.0);
    }

    #[test]
    fn time_efficiency_is_capped_at_double() {
        let mut outcome = clean_outcome();
        outcome.actual_minutes = 1.0;
        let result = compute_reward(&context(), &outcome);
        // 10 / 1 = 10, capped at 2.0, times 20
        assert_eq!(result.breakdown["timeEfficiency"], 40.0);
    }

    #[test]
    fn resource_overuse_is_penalized_linearly() {
        let mut outcome = clean_outcome();
        outcome.resources_used = 7;
        let result = compute_reward(&context(), &outcome);
        assert_eq!(result.breakdown["resourceEfficiency"], -20.0);
    }

    #[test]
    fn errors_flip_quality_negative() {
        let mut outcome = clean_outcome();
        outcome.error_count = 3;
        let result = compute_reward(&context(), &outcome);
        assert_eq!(result.breakdown["quality"], -30.0);
    }

    #[test]
    fn safety_violations_dominate() {
        let mut outcome = clean_outcome();
        outcome.safety_violations = 1;
        let result = compute_reward(&context(), &outcome);
        assert_eq!(result.breakdown["safety"], -50.0);
    }

    #[test]
    fn cost_bands() {
        let mut outcome = clean_outcome();
        outcome.total_cost_usd = 0.09;
        assert_eq!(compute_reward(&context(), &outcome).breakdown["costEfficiency"], 50.0);
        outcome.total_cost_usd = 0.30;
        assert_eq!(compute_reward(&context(), &outcome).breakdown["costEfficiency"], 0.0);
        outcome.total_cost_usd = 0.50;
        assert_eq!(compute_reward(&context(), &outcome).breakdown["costEfficiency"], -20.0);
    }

    #[test]
    fn expensive_overuse_kicks_in_past_three() {
        let mut outcome = clean_outcome();
        outcome.expensive_adapter_usages = 3;
        assert_eq!(
            compute_reward(&context(), &outcome).breakdown["expensiveAdapterOveruse"],
            0.0
        );
        outcome.expensive_adapter_usages = 5;
        assert_eq!(
            compute_reward(&context(), &outcome).breakdown["expensiveAdapterOveruse"],
            -10.0
        );
    }

    #[test]
    fn rotations_penalized_ten_each() {
        let mut outcome = clean_outcome();
        outcome.fallback_rotations = 2;
        assert_eq!(
            compute_reward(&context(), &outcome).breakdown["fallbackRotations"],
            -20.0
        );
    }

    #[test]
    fn reward_is_deterministic() {
        let a = compute_reward(&context(), &clean_outcome());
        let b = compute_reward(&context(), &clean_outcome());
        assert_eq!(a, b);
    }

    #[test]
    fn reward_stays_in_envelope() {
        let mut outcome = clean_outcome();
        outcome.final_phase = Phase::Reverted;
        outcome.error_count = 50;
        outcome.fallback_rotations = 30;
        outcome.safety_violations = 2;
        let result = compute_reward(&context(), &outcome);
        assert_eq!(result.reward, REWARD_MIN);
        // breakdown itself is not clamped
        assert_eq!(result.breakdown["fallbackRotations"], -300.0);
    }
}
