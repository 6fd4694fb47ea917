//! Transaction Coordinator
//!
//! Two-phase commit coordinator for transactions spanning several
//! participants (shards).
//!
//! # Architecture
//!
//! Each transaction gets one coordinator whose durable state lives in a
//! coordinator document:
//! - **Participants** are written before any prepare is sent
//! - **Decision** is written once, and that write is the commit point
//! - **Cleanup** deletes the document after every participant acknowledged
//!
//! Every document write first takes a ticket from a bounded pool shared with
//! other storage writers.
//!
//! # State Machine
//!
//! ```text
//! UNINITIALIZED → PERSISTING_PARTICIPANTS → COLLECTING_VOTES → PERSISTING_DECISION
//!                        │ (interrupted)                          ↑       │
//!                        └────────────────── abort ───────────────┘       ↓
//!                              DONE ← CLEANUP ← DELIVERING_DECISION ←─────┘
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Participants-Before-Prepare**: no prepare goes out before the list is durable
//! 2. **Decision-Before-Delivery**: no commit or abort goes out before the decision is durable
//! 3. **Write-Once Decision**: a durable decision is never replaced, even after restart
//! 4. **No-Cancel-After-Decision**: cancellation has no effect past the commit point

pub mod catalog;
pub mod channel;
pub mod document;
pub mod error;
pub mod gate;
pub mod machine;
pub mod metrics;
pub mod participant;
pub mod retry;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use catalog::{CoordinatorCatalog, RecoveryReport};
pub use channel::{ChannelParticipantClient, ParticipantEndpoint, ParticipantRequest};
pub use document::CoordinatorDocument;
pub use error::CoordinatorError;
pub use gate::{GateAcquisition, TicketPool, WritePermit};
pub use machine::{CoordinatorContext, CoordinatorHandle, StartPoint, TransactionCoordinator};
pub use metrics::StateMetrics;
pub use participant::ParticipantClient;
pub use retry::{Backoff, DeliveryPolicy, RetryConfig};
pub use state::CoordinatorState;
pub use store::{DocumentStore, FileDocumentStore, InMemoryDocumentStore, StoreScan};
pub use types::{
    Decision, DecisionMessage, ParticipantId, PrepareResponse, Timestamp, TransportError, TxnId,
    Vote,
};
