//! Participant Client
//!
//! Thin seam over the transport that carries prepare / commit / abort to
//! participants. Implementations report transport failures as values; the
//! state machine decides what a failure means in each phase.

use async_trait::async_trait;

use super::types::{DecisionMessage, ParticipantId, TransportError, TxnId, Vote};

/// Transport to the participants of a distributed transaction
///
/// `send_decision` must be safe to repeat with the same arguments:
/// delivery is at-least-once and participants apply decisions idempotently.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Ask `participant` to prepare `txn` and return its vote
    async fn prepare(&self, participant: &ParticipantId, txn: TxnId)
    -> Result<Vote, TransportError>;

    /// Deliver the decision; `Ok` is the participant's acknowledgment
    async fn send_decision(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        decision: DecisionMessage,
    ) -> Result<(), TransportError>;
}


#[cfg(test)]
pub use mock::{MockParticipantClient, MockVote};
