// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Time budgets for convergence.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// What to do when a convergence pass is cut short.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Undo the partial pass and rerun the full plan without a budget.
    #[default]
    FullRecompute,
    /// Undo the partial pass and stop.
    Rollback,
}

/// Why a convergence pass degraded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// Wall-clock budget ran out.
    BudgetExceeded,
    /// A rule function returned an error.
    RuntimeError,
}

/// Wall-clock budget of one pass, checked between steps.
#[derive(Copy, Clone, Debug)]
pub struct BudgetGovernor {
    started: Instant,
    limit: Option<Duration>,
}

impl BudgetGovernor {
    /// Starts the clock. A `None` or zero limit never runs out.
    #[must_use]
    pub fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit: limit.filter(|l| !l.is_zero()),
        }
    }

    /// A governor without limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::start(None)
    }

    /// The effective limit.
    #[must_use]
    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Time since the clock started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns `true` once the limit has passed.
    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_none_never_run_out() {
        assert!(BudgetGovernor::start(Some(Duration::ZERO)).limit().is_none());
        assert!(!BudgetGovernor::unbounded().exceeded());
    }

    #[test]
    fn runs_out_after_the_limit() {
        let governor = BudgetGovernor::start(Some(Duration::from_micros(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(governor.exceeded(), "2ms is past a 1us budget");
    }

    #[test]
    fn policy_names() {
        assert_eq!(
            serde_json::to_value(DegradePolicy::FullRecompute).unwrap(),
            serde_json::json!("full_recompute")
        );
        assert_eq!(
            serde_json::to_value(DegradeReason::BudgetExceeded).unwrap(),
            serde_json::json!("budget_exceeded")
        );
    }
}
