//! Coordinator State Definitions
//!
//! States form a total order of progress with no cycles.

use std::fmt;

/// Coordinator FSM States
///
/// Numeric IDs leave gaps so intermediate states can be added later
/// without renumbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i16)]
pub enum CoordinatorState {
    /// Object constructed, nothing persisted
    Uninitialized = 0,

    /// Acquiring the write gate and durably writing the participant list
    PersistingParticipants = 10,

    /// Prepare sent to every participant, waiting for votes
    CollectingVotes = 20,

    /// Acquiring the write gate and durably writing the decision.
    /// Completion of this write is the commit point.
    PersistingDecision = 30,

    /// Pushing the durable decision to every participant until acknowledged
    DeliveringDecision = 40,

    /// Deleting the coordinator document
    Cleanup = 50,

    /// Terminal
    Done = 60,
}

impl CoordinatorState {
    pub const ALL: [CoordinatorState; 7] = [
        CoordinatorState::Uninitialized,
        CoordinatorState::PersistingParticipants,
        CoordinatorState::CollectingVotes,
        CoordinatorState::PersistingDecision,
        CoordinatorState::DeliveringDecision,
        CoordinatorState::Cleanup,
        CoordinatorState::Done,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Done)
    }

    /// States in which the cancellation signal can still change the outcome
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Uninitialized
                | CoordinatorState::PersistingParticipants
                | CoordinatorState::CollectingVotes
        )
    }

    /// The decision is durable in every state past PersistingDecision
    #[inline]
    pub fn is_past_commit_point(&self) -> bool {
        *self > CoordinatorState::PersistingDecision
    }

    /// Dense index into per-state tables
    #[inline]
    pub fn index(&self) -> usize {
        (*self as i16 / 10) as usize
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Uninitialized => "UNINITIALIZED",
            CoordinatorState::PersistingParticipants => "PERSISTING_PARTICIPANTS",
            CoordinatorState::CollectingVotes => "COLLECTING_VOTES",
            CoordinatorState::PersistingDecision => "PERSISTING_DECISION",
            CoordinatorState::DeliveringDecision => "DELIVERING_DECISION",
            CoordinatorState::Cleanup => "CLEANUP",
            CoordinatorState::Done => "DONE",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
