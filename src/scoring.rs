//! Confidence scoring.
//!
//! The score is a pure function of three independent signals and their
//! weights. Each signal is clamped to [0.0, 1.0] before weighting, so the
//! result stays in range whatever the inputs are.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::evaluation::EvaluationRun;
use crate::{Error, Result};

/// Tolerance when checking that weights sum to one.
const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub acceptance: f64,
    pub review: f64,
    pub complexity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            acceptance: 0.6,
            review: 0.3,
            complexity: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("acceptance", self.acceptance),
            ("review", self.review),
            ("complexity", self.complexity),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::Validation(format!(
                    "scoring weight {} must be within [0, 1], got {}",
                    name, w
                )));
            }
        }
        let sum = self.acceptance + self.review + self.complexity;
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(Error::Validation(format!(
                "scoring weights must sum to 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Raw signals. Values outside [0, 1] are tolerated and clamped.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Signals {
    pub acceptance: f64,
    pub review: f64,
    pub complexity: f64,
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Weighted combination of the clamped signals.
pub fn score(signals: &Signals, weights: &ScoreWeights) -> f64 {
    let raw = clamp_unit(signals.acceptance) * weights.acceptance
        + clamp_unit(signals.review) * weights.review
        + clamp_unit(signals.complexity) * weights.complexity;
    clamp_unit(raw)
}

/// Mean of the signals stages reported, or the fraction of stages passed
/// when none did. An empty run counts as fully passed.
pub fn acceptance_signal(run: &EvaluationRun) -> f64 {
    let reported: Vec<f64> = run.outcomes.iter().filter_map(|o| o.signal).collect();
    if !reported.is_empty() {
        return reported.iter().sum::<f64>() / reported.len() as f64;
    }
    if run.outcomes.is_empty() {
        return 1.0;
    }
    run.passed_count() as f64 / run.outcomes.len() as f64
}

fn confidence_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^\s*CONFIDENCE:\s*([-+]?[0-9]*\.?[0-9]+)\s*$")
            .expect("confidence pattern is valid")
    })
}

/// Review signal from collaborator output: the last `CONFIDENCE: x` line,
/// else full confidence if it reported completion and none if not.
pub fn review_signal(raw_output: &str, self_reported_complete: bool) -> f64 {
    let parsed = confidence_line()
        .captures_iter(raw_output)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .last();
    match parsed {
        Some(value) => value,
        None if self_reported_complete => 1.0,
        None => 0.0,
    }
}

/// `1 - min(1, changed / budget)`. A zero budget tolerates no change.
pub fn complexity_signal(changed_lines: usize, budget_lines: usize) -> f64 {
    if budget_lines == 0 {
        return if changed_lines == 0 { 1.0 } else { 0.0 };
    }
    1.0 - (changed_lines as f64 / budget_lines as f64).min(1.0)
}
