//! Per-state coordinator counters
//!
//! External monitoring reads how many coordinators sit in each state. A
//! transition moves one unit from the old state to the new one under a single
//! lock, so a snapshot never double-counts or loses a coordinator.

use std::sync::Mutex;

use super::state::CoordinatorState;

const STATE_COUNT: usize = CoordinatorState::ALL.len();

#[derive(Debug, Default)]
pub struct StateMetrics {
    counts: Mutex<[u64; STATE_COUNT]>,
}

impl StateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move one coordinator from `from` (None = newly created) to `to`
    pub fn transition(&self, from: Option<CoordinatorState>, to: CoordinatorState) {
        // counters are plain integers; a poisoned lock still holds valid data
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(from) = from {
            counts[from.index()] = counts[from.index()].saturating_sub(1);
        }
        counts[to.index()] += 1;
    }

    /// Forget a coordinator that left the catalog in `state`
    pub fn release(&self, state: CoordinatorState) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts[state.index()] = counts[state.index()].saturating_sub(1);
    }

    pub fn count(&self, state: CoordinatorState) -> u64 {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())[state.index()]
    }

    /// Consistent view of every state's count
    pub fn snapshot(&self) -> Vec<(CoordinatorState, u64)> {
        let counts = *self.counts.lock().unwrap_or_else(|e| e.into_inner());
        CoordinatorState::ALL
            .iter()
            .map(|state| (*state, counts[state.index()]))
            .collect()
    }

    /// Coordinators not yet in a terminal state
    pub fn active(&self) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        CoordinatorState::ALL
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| counts[s.index()])
            .sum()
    }
}
