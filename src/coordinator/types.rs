//! Coordinator Core Types
//!
//! Identity, vote and decision types shared by the state machine, the
//! document store and the participant transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identity: (session id, transaction number)
///
/// Globally unique per logical transaction and used as the primary key of
/// the coordinator document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId {
    pub session_id: uuid::Uuid,
    pub txn_number: i64,
}

impl TxnId {
    pub fn new(session_id: uuid::Uuid, txn_number: i64) -> Self {
        Self {
            session_id,
            txn_number,
        }
    }

    /// Fresh session with the given transaction number
    pub fn random(txn_number: i64) -> Self {
        Self::new(uuid::Uuid::new_v4(), txn_number)
    }

    /// Stable key used for file names in the file-backed store
    pub fn storage_key(&self) -> String {
        format!("{}-{}", self.session_id.simple(), self.txn_number)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.txn_number)
    }
}

/// Identifier of one participant (storage partition / shard)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Logical timestamp (seconds, increment) - ordered lexicographically
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// The coordinator's single irrevocable outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Commit => "COMMIT",
            Decision::Abort => "ABORT",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision as delivered to participants
///
/// A commit always travels with the commit timestamp every participant must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionMessage {
    Commit { commit_timestamp: Timestamp },
    Abort,
}

impl DecisionMessage {
    pub fn decision(&self) -> Decision {
        match self {
            DecisionMessage::Commit { .. } => Decision::Commit,
            DecisionMessage::Abort => Decision::Abort,
        }
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self {
            DecisionMessage::Commit { commit_timestamp } => Some(*commit_timestamp),
            DecisionMessage::Abort => None,
        }
    }
}

/// A participant's answer to prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Ready to commit; the participant's writes are prepared at `prepare_timestamp`
    Commit { prepare_timestamp: Timestamp },
    /// Must abort
    Abort,
}

impl Vote {
    #[inline]
    pub fn is_commit(&self) -> bool {
        matches!(self, Vote::Commit { .. })
    }
}

/// Transport-level failure talking to a participant
///
/// Always recoverable from the coordinator's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport failure: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Outcome of one prepare round-trip, matched exhaustively during voting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareResponse {
    Vote(Vote),
    TransportFailed(TransportError),
}

impl From<Result<Vote, TransportError>> for PrepareResponse {
    fn from(result: Result<Vote, TransportError>) -> Self {
        match result {
            Ok(vote) => PrepareResponse::Vote(vote),
            Err(e) => PrepareResponse::TransportFailed(e),
        }
    }
}
