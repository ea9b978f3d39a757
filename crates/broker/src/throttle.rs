// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-worker adaptive injection pacing.
//!
//! A worker that keeps missing its verification window is usually busy
//! (long tool call, modal prompt, redraw storm). Backing off injection
//! pressure gives the CLI room to drain; sustained successes earn the pace
//! back down to the floor.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Number of recent outcomes retained per worker.
const OUTCOME_WINDOW: usize = 10;

/// Successes required before the delay is halved.
const SUCCESSES_PER_STEP: u32 = 3;

/// Result of one injection attempt, as seen by the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Pacing parameters. `floor` is the healthy-state inter-injection delay;
/// `ceiling` caps the exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { floor: Duration::from_millis(100), ceiling: Duration::from_secs(5) }
    }
}

/// Adaptive delay state for a single worker. Owned by that worker's delivery
/// task; never shared across workers.
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    outcomes: VecDeque<Outcome>,
    current_delay: Duration,
    consecutive_successes: u32,
    last_injection: Option<Instant>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            current_delay: config.floor,
            config,
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            consecutive_successes: 0,
            last_injection: None,
        }
    }

    /// Record the outcome of the most recent injection attempt and adjust
    /// the delay.
    pub fn record(&mut self, outcome: Outcome) {
        if self.outcomes.len() == OUTCOME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);

        match outcome {
            Outcome::Success => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= SUCCESSES_PER_STEP {
                    self.consecutive_successes = 0;
                    self.current_delay = (self.current_delay / 2).max(self.config.floor);
                }
            }
            Outcome::Failure | Outcome::Timeout => {
                self.consecutive_successes = 0;
                self.current_delay = (self.current_delay * 2).min(self.config.ceiling);
            }
        }
    }

    /// Mark that an injection was just written; starts the next delay window.
    pub fn mark_injection(&mut self) {
        self.last_injection = Some(Instant::now());
    }

    /// Earliest instant the next injection may be written.
    pub fn next_allowed_at(&self) -> Instant {
        match self.last_injection {
            Some(at) => at + self.current_delay,
            None => Instant::now(),
        }
    }

    /// Current inter-injection delay.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Successes since the last non-success outcome, modulo the halving step.
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Recent outcomes, oldest first.
    pub fn outcomes(&self) -> impl Iterator<Item = Outcome> + '_ {
        self.outcomes.iter().copied()
    }
}

#[cfg(test)]
#[path = "throttle_tests.rs"]
mod tests;
