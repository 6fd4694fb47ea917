//! Coordinator Document
//!
//! The single persisted record per transaction:
//!
//! ```text
//! { id: {session_id, txn_number},
//!   participants: [participant_id...],
//!   decision: optional<COMMIT|ABORT>,
//!   commit_timestamp: optional<timestamp> }   // present iff decision = COMMIT
//! ```

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::CoordinatorError;
use super::types::{Decision, DecisionMessage, ParticipantId, Timestamp, TxnId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    pub id: TxnId,
    pub participants: Vec<ParticipantId>,
    pub decision: Option<Decision>,
    pub commit_timestamp: Option<Timestamp>,
}

impl CoordinatorDocument {
    /// Document holding only the participant list (no decision yet)
    pub fn new(id: TxnId, participants: Vec<ParticipantId>) -> Result<Self, CoordinatorError> {
        validate_participants(&participants)?;
        Ok(Self {
            id,
            participants,
            decision: None,
            commit_timestamp: None,
        })
    }

    /// Copy of this document carrying `decision`
    pub fn with_decision(&self, decision: DecisionMessage) -> Self {
        Self {
            id: self.id,
            participants: self.participants.clone(),
            decision: Some(decision.decision()),
            commit_timestamp: decision.commit_timestamp(),
        }
    }

    /// Persisted decision in its deliverable form
    pub fn decision_message(&self) -> Result<Option<DecisionMessage>, CoordinatorError> {
        match (self.decision, self.commit_timestamp) {
            (None, None) => Ok(None),
            (Some(Decision::Abort), None) => Ok(Some(DecisionMessage::Abort)),
            (Some(Decision::Commit), Some(commit_timestamp)) => {
                Ok(Some(DecisionMessage::Commit { commit_timestamp }))
            }
            (decision, ts) => Err(CoordinatorError::ProtocolViolation(format!(
                "txn {}: decision {:?} inconsistent with commit timestamp {:?}",
                self.id, decision, ts
            ))),
        }
    }

    /// Check the per-document invariants
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        validate_participants(&self.participants)?;
        self.decision_message().map(|_| ())
    }

    /// Check that replacing `existing` with `self` only adds a decision
    ///
    /// `id` and `participants` are immutable; a persisted decision (and its
    /// commit timestamp) is write-once. Rewriting identical content is allowed.
    pub fn validate_overwrite(&self, existing: &CoordinatorDocument) -> Result<(), CoordinatorError> {
        self.validate()?;

        if self.id != existing.id {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "document id changed from {} to {}",
                existing.id, self.id
            )));
        }

        if self.participants != existing.participants {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "txn {}: participant list is immutable",
                self.id
            )));
        }

        if let Some(persisted) = existing.decision_message()?
            && self.decision_message()? != Some(persisted)
        {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "txn {}: decision already persisted as {}",
                self.id,
                persisted.decision()
            )));
        }

        Ok(())
    }
}

fn validate_participants(participants: &[ParticipantId]) -> Result<(), CoordinatorError> {
    if participants.is_empty() {
        return Err(CoordinatorError::EmptyParticipants);
    }
    let mut seen = FxHashSet::default();
    for p in participants {
        if !seen.insert(p) {
            return Err(CoordinatorError::DuplicateParticipant(p.clone()));
        }
    }
    Ok(())
}

impl fmt::Display for CoordinatorDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CoordinatorDoc[{}] participants={} decision={}",
            self.id,
            self.participants.len(),
            self.decision.map(|d| d.as_str()).unwrap_or("NONE")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::new(*n)).collect()
    }

    fn doc() -> CoordinatorDocument {
        CoordinatorDocument::new(TxnId::random(1), participants(&["s0", "s1", "s2"])).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_participant_lists() {
        let id = TxnId::random(1);
        assert!(matches!(
            CoordinatorDocument::new(id, vec![]),
            Err(CoordinatorError::EmptyParticipants)
        ));
        assert!(matches!(
            CoordinatorDocument::new(id, participants(&["a", "b", "a"])),
            Err(CoordinatorError::DuplicateParticipant(p)) if p.as_str() == "a"
        ));
    }

    #[test]
    fn test_commit_timestamp_present_iff_commit() {
        let base = doc();
        let committed = base.with_decision(DecisionMessage::Commit {
            commit_timestamp: Timestamp::new(9, 1),
        });
        assert_eq!(committed.decision, Some(Decision::Commit));
        assert_eq!(committed.commit_timestamp, Some(Timestamp::new(9, 1)));

        let aborted = base.with_decision(DecisionMessage::Abort);
        assert_eq!(aborted.decision, Some(Decision::Abort));
        assert!(aborted.commit_timestamp.is_none());

        let mut broken = aborted.clone();
        broken.commit_timestamp = Some(Timestamp::new(1, 1));
        assert!(broken.validate().is_err());

        let mut broken = committed;
        broken.commit_timestamp = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_overwrite_may_add_decision() {
        let base = doc();
        let decided = base.with_decision(DecisionMessage::Abort);
        assert!(decided.validate_overwrite(&base).is_ok());
        // identical rewrite is harmless
        assert!(decided.validate_overwrite(&decided).is_ok());
    }

    #[test]
    fn test_decision_is_write_once() {
        let base = doc();
        let committed = base.with_decision(DecisionMessage::Commit {
            commit_timestamp: Timestamp::new(3, 0),
        });
        let aborted = base.with_decision(DecisionMessage::Abort);
        assert!(matches!(
            aborted.validate_overwrite(&committed),
            Err(CoordinatorError::ProtocolViolation(_))
        ));
        // removing the decision is also an overwrite of it
        assert!(base.validate_overwrite(&committed).is_err());
        // a different commit timestamp is a different decision
        let recommitted = base.with_decision(DecisionMessage::Commit {
            commit_timestamp: Timestamp::new(4, 0),
        });
        assert!(recommitted.validate_overwrite(&committed).is_err());
    }

    #[test]
    fn test_participants_are_immutable() {
        let base = doc();
        let mut changed = base.clone();
        changed.participants.push(ParticipantId::new("s3"));
        assert!(changed.validate_overwrite(&base).is_err());
    }
}
