//! Coordinator Error Types
//!
//! Storage errors are recoverable and retried inside the state machine;
//! transport failures and interruptions are routine outcomes there and never
//! surface as errors. Protocol violations and corrupt records are fatal to one
//! coordinator instance only. Nothing here may take down the host process.

use thiserror::Error;

use super::types::ParticipantId;

#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    // === Validation Errors ===
    #[error("Participant list must not be empty")]
    EmptyParticipants,

    #[error("Participant listed more than once: {0}")]
    DuplicateParticipant(ParticipantId),

    // === Recoverable Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    // === Fatal (per coordinator) ===
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Stored record fails its checksum or does not decode
    #[error("Corrupt coordinator document: {0}")]
    Corrupt(String),

    #[error("Gave up delivering decision to {participant} after {attempts} attempts")]
    DeliveryAbandoned {
        participant: ParticipantId,
        attempts: u32,
    },

    #[error("Coordinator stopped before publishing a result")]
    CoordinatorGone,

    // === Ambient ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CoordinatorError {
    /// Stable identifier for logs and callers
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::EmptyParticipants => "EMPTY_PARTICIPANTS",
            CoordinatorError::DuplicateParticipant(_) => "DUPLICATE_PARTICIPANT",
            CoordinatorError::Storage(_) => "STORAGE_ERROR",
            CoordinatorError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            CoordinatorError::Corrupt(_) => "CORRUPT_DOCUMENT",
            CoordinatorError::DeliveryAbandoned { .. } => "DELIVERY_ABANDONED",
            CoordinatorError::CoordinatorGone => "COORDINATOR_GONE",
            CoordinatorError::Config(_) => "CONFIG_ERROR",
            CoordinatorError::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the state machine retries instead of failing
    ///
    /// Corruption is not retryable: rereading the same record fails the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::Storage(_) | CoordinatorError::Io(_))
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        CoordinatorError::Io(e.to_string())
    }
}

impl From<bincode::Error> for CoordinatorError {
    fn from(e: bincode::Error) -> Self {
        CoordinatorError::Storage(format!("document encoding: {}", e))
    }
}

impl From<serde_yaml::Error> for CoordinatorError {
    fn from(e: serde_yaml::Error) -> Self {
        CoordinatorError::Config(e.to_string())
    }
}
