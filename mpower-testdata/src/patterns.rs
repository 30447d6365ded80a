// MPower Testdata - Load patterns
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Load patterns driving the CPU and screen power proxies.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Load pattern in mW over run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LoadPattern {
    /// Constant load.
    Constant { value: f64 },

    /// Alternates between two levels.
    ///
    /// `high` for the first `duty` fraction of each period.
    Square {
        low: f64,
        high: f64,
        period_s: f64,
        duty: f64,
    },

    /// Piecewise-constant levels as `(start_s, value)`; the value persists
    /// until the next start.
    Step { levels: Vec<(f64, f64)> },

    /// Bounded random walk.
    RandomWalk {
        start: f64,
        step_std: f64,
        min: f64,
        max: f64,
    },
}

impl LoadPattern {
    pub fn constant(value: f64) -> Self {
        LoadPattern::Constant { value }
    }

    pub fn square(low: f64, high: f64, period_s: f64) -> Self {
        LoadPattern::Square {
            low,
            high,
            period_s,
            duty: 0.5,
        }
    }

    pub fn random_walk(start: f64, step_std: f64, min: f64, max: f64) -> Self {
        LoadPattern::RandomWalk {
            start,
            step_std,
            min,
            max,
        }
    }
}

/// Per-run evaluation state of a pattern.
#[derive(Debug, Clone)]
pub struct PatternState {
    current: Option<f64>,
}

impl PatternState {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Load at time `t_s`, never negative.
    pub fn evaluate(&mut self, pattern: &LoadPattern, t_s: f64, rng: &mut (impl Rng + ?Sized)) -> f64 {
        let value = match pattern {
            LoadPattern::Constant { value } => *value,
            LoadPattern::Square {
                low,
                high,
                period_s,
                duty,
            } => {
                if *period_s <= 0.0 {
                    *low
                } else if (t_s % period_s) / period_s < *duty {
                    *high
                } else {
                    *low
                }
            }
            LoadPattern::Step { levels } => {
                let mut value = levels.first().map(|(_, v)| *v).unwrap_or(0.0);
                for (start, v) in levels {
                    if t_s >= *start {
                        value = *v;
                    } else {
                        break;
                    }
                }
                value
            }
            LoadPattern::RandomWalk {
                start,
                step_std,
                min,
                max,
            } => {
                let next = match self.current {
                    None => *start,
                    Some(prev) => {
                        let step = Normal::new(0.0, *step_std)
                            .map(|n| n.sample(rng))
                            .unwrap_or(0.0);
                        prev + step
                    }
                };
                let next = next.clamp(*min, *max);
                self.current = Some(next);
                next
            }
        };
        value.max(0.0)
    }
}

impl Default for PatternState {
    fn default() -> Self {
        Self::new()
    }
}
